use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use stellar_domain::{Node, NodeRepository};
use stellar_errors::{StellarError, StellarResult};
use tracing::debug;

use super::{decode_document, encode_document, is_unique_violation};

pub struct SqliteNodeRepository {
    pool: SqlitePool,
}

impl SqliteNodeRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_node(row: &sqlx::sqlite::SqliteRow) -> StellarResult<Node> {
        let document: String = row.try_get("document")?;
        decode_document(&document)
    }
}

#[async_trait]
impl NodeRepository for SqliteNodeRepository {
    async fn insert(&self, node: &Node) -> StellarResult<()> {
        let document = encode_document(node)?;
        sqlx::query(
            r#"
            INSERT INTO nodes (id, ip, port, status, document, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&node.id)
        .bind(&node.ip)
        .bind(node.port as i64)
        .bind(node.status.as_str())
        .bind(document)
        .bind(node.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StellarError::Duplicate(format!("节点地址已注册: {}", node.address()))
            } else {
                StellarError::from(e)
            }
        })?;

        debug!("写入节点成功: {}", node.id);
        Ok(())
    }

    async fn get(&self, id: &str) -> StellarResult<Option<Node>> {
        let row = sqlx::query("SELECT document FROM nodes WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_node).transpose()
    }

    async fn find_by_address(&self, ip: &str, port: u16) -> StellarResult<Option<Node>> {
        let row = sqlx::query("SELECT document FROM nodes WHERE ip = $1 AND port = $2")
            .bind(ip)
            .bind(port as i64)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_node).transpose()
    }

    async fn list(&self) -> StellarResult<Vec<Node>> {
        let rows = sqlx::query("SELECT document FROM nodes ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_node).collect()
    }

    async fn update(&self, node: &Node) -> StellarResult<()> {
        let document = encode_document(node)?;
        let result = sqlx::query(
            r#"
            UPDATE nodes
            SET ip = $2, port = $3, status = $4, document = $5, updated_at = $6
            WHERE id = $1
            "#,
        )
        .bind(&node.id)
        .bind(&node.ip)
        .bind(node.port as i64)
        .bind(node.status.as_str())
        .bind(document)
        .bind(node.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StellarError::node_not_found(&node.id));
        }
        Ok(())
    }

    async fn update_if_unchanged(
        &self,
        node: &Node,
        expected_updated_at: DateTime<Utc>,
    ) -> StellarResult<bool> {
        let document = encode_document(node)?;
        let result = sqlx::query(
            r#"
            UPDATE nodes
            SET ip = $2, port = $3, status = $4, document = $5, updated_at = $6
            WHERE id = $1 AND updated_at = $7
            "#,
        )
        .bind(&node.id)
        .bind(&node.ip)
        .bind(node.port as i64)
        .bind(node.status.as_str())
        .bind(document)
        .bind(node.updated_at.to_rfc3339())
        .bind(expected_updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        if self.get(&node.id).await?.is_none() {
            return Err(StellarError::node_not_found(&node.id));
        }
        Ok(false)
    }

    async fn delete(&self, id: &str) -> StellarResult<bool> {
        let result = sqlx::query("DELETE FROM nodes WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        debug!("删除节点: {id}");
        Ok(result.rows_affected() > 0)
    }
}
