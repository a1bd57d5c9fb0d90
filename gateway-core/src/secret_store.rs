use async_trait::async_trait;

use crate::error::GatewayResult;

/// External collaborator (spec.md §1): persistence for OAuth2 records lives
/// behind this seam so the core never depends on a concrete database. The
/// two concrete implementations the core ships (`oauth::store::InMemoryStore`
/// and, behind the `redis-store` feature, `oauth::store::RedisStore`) both
/// satisfy `oauth::store::Store` directly rather than this trait — this
/// trait is for collaborators that want to plug in an entirely different
/// persistence layer (e.g. the apiserver's own database) without adopting
/// the gateway's Redis/in-memory choices.
#[async_trait]
pub trait SecretStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> GatewayResult<Option<String>>;
    async fn put(&self, key: &str, value: &str, ttl_secs: Option<i64>) -> GatewayResult<()>;
    async fn delete(&self, key: &str) -> GatewayResult<()>;
}
