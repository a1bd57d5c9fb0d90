//! Pluggable OAuth2 persistence (spec §4.6): an in-memory map/mutex store
//! for single-instance deployments, or Redis for multi-instance ones. Both
//! expose the same `Store` trait and both must apply lazy expiry on read —
//! the testable properties require that an expired code/token never
//! authorizes a request regardless of backend.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::{AuthorizationCode, Client, Token};
use crate::clock::Clock;
use crate::error::GatewayResult;

#[async_trait]
pub trait Store: Send + Sync + 'static {
    async fn put_client(&self, client: Client) -> GatewayResult<()>;
    async fn get_client(&self, id: &str) -> GatewayResult<Option<Client>>;

    async fn put_code(&self, code: AuthorizationCode) -> GatewayResult<()>;
    /// Lazily expires: an expired code is deleted as a side effect of the
    /// lookup and `None` is returned.
    async fn take_code(&self, code: &str) -> GatewayResult<Option<AuthorizationCode>>;

    async fn put_token(&self, token: Token) -> GatewayResult<()>;
    async fn get_token_by_access(&self, access_token: &str) -> GatewayResult<Option<Token>>;
    async fn get_token_by_refresh(&self, refresh_token: &str) -> GatewayResult<Option<Token>>;
    async fn delete_token_by_access(&self, access_token: &str) -> GatewayResult<()>;
}

pub struct InMemoryStore {
    clock: Arc<dyn Clock>,
    clients: parking_lot::RwLock<HashMap<String, Client>>,
    codes: parking_lot::RwLock<HashMap<String, AuthorizationCode>>,
    tokens: parking_lot::RwLock<HashMap<String, Token>>,
}

impl InMemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            clients: parking_lot::RwLock::new(HashMap::new()),
            codes: parking_lot::RwLock::new(HashMap::new()),
            tokens: parking_lot::RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn put_client(&self, client: Client) -> GatewayResult<()> {
        self.clients.write().insert(client.id.clone(), client);
        Ok(())
    }

    async fn get_client(&self, id: &str) -> GatewayResult<Option<Client>> {
        Ok(self.clients.read().get(id).cloned())
    }

    async fn put_code(&self, code: AuthorizationCode) -> GatewayResult<()> {
        self.codes.write().insert(code.code.clone(), code);
        Ok(())
    }

    async fn take_code(&self, code: &str) -> GatewayResult<Option<AuthorizationCode>> {
        let mut codes = self.codes.write();
        let Some(entry) = codes.get(code).cloned() else {
            return Ok(None);
        };
        // Single-use regardless of expiry: a lookup always consumes it.
        codes.remove(code);
        if entry.expires_at <= self.clock.now_unix_secs() {
            return Ok(None);
        }
        Ok(Some(entry))
    }

    async fn put_token(&self, token: Token) -> GatewayResult<()> {
        self.tokens.write().insert(token.access_token.clone(), token);
        Ok(())
    }

    async fn get_token_by_access(&self, access_token: &str) -> GatewayResult<Option<Token>> {
        let expired = {
            let tokens = self.tokens.read();
            match tokens.get(access_token) {
                Some(t) if t.expires_at <= self.clock.now_unix_secs() => true,
                Some(t) => return Ok(Some(t.clone())),
                None => return Ok(None),
            }
        };
        if expired {
            self.tokens.write().remove(access_token);
        }
        Ok(None)
    }

    async fn get_token_by_refresh(&self, refresh_token: &str) -> GatewayResult<Option<Token>> {
        let found = self
            .tokens
            .read()
            .values()
            .find(|t| t.refresh_token == refresh_token)
            .cloned();
        match found {
            Some(t) if t.expires_at <= self.clock.now_unix_secs() => {
                self.tokens.write().remove(&t.access_token);
                Ok(None)
            }
            other => Ok(other),
        }
    }

    async fn delete_token_by_access(&self, access_token: &str) -> GatewayResult<()> {
        self.tokens.write().remove(access_token);
        Ok(())
    }
}

#[cfg(feature = "redis-store")]
pub mod redis_store {
    use super::*;
    use redis::AsyncCommands;

    const CLIENT_PREFIX: &str = "oauth:client:";
    const CODE_PREFIX: &str = "oauth:code:";
    const TOKEN_PREFIX: &str = "oauth:token:";
    const REFRESH_PREFIX: &str = "oauth:refresh:";

    /// Redis-backed store: JSON blobs under the key prefixes above, relying
    /// on Redis's own TTL (set to match `expiresAt` at write time) instead
    /// of re-implementing lazy expiry — a `GET` on an expired key already
    /// returns nothing.
    pub struct RedisStore {
        conn: redis::aio::ConnectionManager,
        clock: Arc<dyn Clock>,
    }

    impl RedisStore {
        pub async fn connect(url: &str, clock: Arc<dyn Clock>) -> GatewayResult<Self> {
            let client = redis::Client::open(url)
                .map_err(|e| crate::error::GatewayError::Internal(format!("redis url: {e}")))?;
            let conn = client
                .get_connection_manager()
                .await
                .map_err(|e| crate::error::GatewayError::Internal(format!("redis connect: {e}")))?;
            Ok(Self { conn, clock })
        }

        fn ttl_secs(&self, expires_at: i64) -> i64 {
            (expires_at - self.clock.now_unix_secs()).max(1)
        }
    }

    #[async_trait]
    impl Store for RedisStore {
        async fn put_client(&self, client: Client) -> GatewayResult<()> {
            let mut conn = self.conn.clone();
            let key = format!("{CLIENT_PREFIX}{}", client.id);
            let json = serde_json::to_string(&client)
                .map_err(|e| crate::error::GatewayError::Internal(e.to_string()))?;
            conn.set::<_, _, ()>(key, json)
                .await
                .map_err(|e| crate::error::GatewayError::Internal(e.to_string()))?;
            Ok(())
        }

        async fn get_client(&self, id: &str) -> GatewayResult<Option<Client>> {
            let mut conn = self.conn.clone();
            let key = format!("{CLIENT_PREFIX}{id}");
            let raw: Option<String> = conn
                .get(key)
                .await
                .map_err(|e| crate::error::GatewayError::Internal(e.to_string()))?;
            Ok(raw.and_then(|s| serde_json::from_str(&s).ok()))
        }

        async fn put_code(&self, code: AuthorizationCode) -> GatewayResult<()> {
            let mut conn = self.conn.clone();
            let key = format!("{CODE_PREFIX}{}", code.code);
            let ttl = self.ttl_secs(code.expires_at) as u64;
            let json = serde_json::to_string(&code)
                .map_err(|e| crate::error::GatewayError::Internal(e.to_string()))?;
            conn.set_ex::<_, _, ()>(key, json, ttl)
                .await
                .map_err(|e| crate::error::GatewayError::Internal(e.to_string()))?;
            Ok(())
        }

        async fn take_code(&self, code: &str) -> GatewayResult<Option<AuthorizationCode>> {
            let mut conn = self.conn.clone();
            let key = format!("{CODE_PREFIX}{code}");
            let raw: Option<String> = conn
                .get(&key)
                .await
                .map_err(|e| crate::error::GatewayError::Internal(e.to_string()))?;
            conn.del::<_, ()>(&key)
                .await
                .map_err(|e| crate::error::GatewayError::Internal(e.to_string()))?;
            Ok(raw.and_then(|s| serde_json::from_str(&s).ok()))
        }

        async fn put_token(&self, token: Token) -> GatewayResult<()> {
            let mut conn = self.conn.clone();
            let ttl = self.ttl_secs(token.expires_at) as u64;
            let key = format!("{TOKEN_PREFIX}{}", token.access_token);
            let refresh_key = format!("{REFRESH_PREFIX}{}", token.refresh_token);
            let json = serde_json::to_string(&token)
                .map_err(|e| crate::error::GatewayError::Internal(e.to_string()))?;
            conn.set_ex::<_, _, ()>(key, json, ttl)
                .await
                .map_err(|e| crate::error::GatewayError::Internal(e.to_string()))?;
            conn.set_ex::<_, _, ()>(refresh_key, token.access_token.clone(), ttl)
                .await
                .map_err(|e| crate::error::GatewayError::Internal(e.to_string()))?;
            Ok(())
        }

        async fn get_token_by_access(&self, access_token: &str) -> GatewayResult<Option<Token>> {
            let mut conn = self.conn.clone();
            let key = format!("{TOKEN_PREFIX}{access_token}");
            let raw: Option<String> = conn
                .get(key)
                .await
                .map_err(|e| crate::error::GatewayError::Internal(e.to_string()))?;
            Ok(raw.and_then(|s| serde_json::from_str(&s).ok()))
        }

        async fn get_token_by_refresh(&self, refresh_token: &str) -> GatewayResult<Option<Token>> {
            let mut conn = self.conn.clone();
            let refresh_key = format!("{REFRESH_PREFIX}{refresh_token}");
            let access: Option<String> = conn
                .get(&refresh_key)
                .await
                .map_err(|e| crate::error::GatewayError::Internal(e.to_string()))?;
            let Some(access_token) = access else {
                return Ok(None);
            };
            self.get_token_by_access(&access_token).await
        }

        async fn delete_token_by_access(&self, access_token: &str) -> GatewayResult<()> {
            let mut conn = self.conn.clone();
            let key = format!("{TOKEN_PREFIX}{access_token}");
            let raw: Option<String> = conn
                .get(&key)
                .await
                .map_err(|e| crate::error::GatewayError::Internal(e.to_string()))?;
            conn.del::<_, ()>(&key)
                .await
                .map_err(|e| crate::error::GatewayError::Internal(e.to_string()))?;
            if let Some(token) = raw.and_then(|s| serde_json::from_str::<Token>(&s).ok()) {
                let refresh_key = format!("{REFRESH_PREFIX}{}", token.refresh_token);
                conn.del::<_, ()>(refresh_key)
                    .await
                    .map_err(|e| crate::error::GatewayError::Internal(e.to_string()))?;
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::test_support::FakeClock;

    fn store() -> (InMemoryStore, Arc<FakeClock>) {
        let clock = Arc::new(FakeClock::new(1000));
        (InMemoryStore::new(clock.clone()), clock)
    }

    #[tokio::test]
    async fn code_is_single_use() {
        let (store, _clock) = store();
        let code = AuthorizationCode {
            code: "abc".into(),
            client_id: "c".into(),
            redirect_uri: "https://x/cb".into(),
            scope: "mcp".into(),
            code_challenge: None,
            code_challenge_method: None,
            expires_at: 2000,
            created_at: 1000,
        };
        store.put_code(code).await.unwrap();
        assert!(store.take_code("abc").await.unwrap().is_some());
        assert!(store.take_code("abc").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_code_is_deleted_on_lookup() {
        let (store, clock) = store();
        let code = AuthorizationCode {
            code: "abc".into(),
            client_id: "c".into(),
            redirect_uri: "https://x/cb".into(),
            scope: "mcp".into(),
            code_challenge: None,
            code_challenge_method: None,
            expires_at: 1500,
            created_at: 1000,
        };
        store.put_code(code).await.unwrap();
        clock.advance(600);
        assert!(store.take_code("abc").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_token_never_authorizes() {
        let (store, clock) = store();
        let token = Token {
            access_token: "at".into(),
            refresh_token: "rt".into(),
            token_type: "Bearer".into(),
            client_id: "c".into(),
            scope: "mcp".into(),
            expires_at: 1500,
            created_at: 1000,
        };
        store.put_token(token).await.unwrap();
        clock.advance(600);
        assert!(store.get_token_by_access("at").await.unwrap().is_none());
    }
}
