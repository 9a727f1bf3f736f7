use std::sync::Arc;
use std::time::Duration;

use argon2::password_hash::{rand_core::OsRng, SaltString};
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use jsonwebtoken::{encode, EncodingKey, Header};

use courier_db::{is_unique_violation, Database};
use courier_types::api::{AuthResponse, Claims, LoginRequest, RegisterRequest};
use courier_types::models::User;

use crate::ServiceError;

/// Maximum password length in bytes. Prevents DoS via expensive Argon2
/// hashing on extremely long inputs.
const MAX_PASSWORD_LEN: usize = 128;

#[derive(Clone)]
pub struct AuthService {
    db: Arc<Database>,
    jwt_secret: String,
    jwt_expiry: Duration,
}

impl AuthService {
    pub fn new(db: Arc<Database>, jwt_secret: String, jwt_expiry: Duration) -> Self {
        Self {
            db,
            jwt_secret,
            jwt_expiry,
        }
    }

    /// Create an account and hand back a token for it. Argon2 hashing runs
    /// off the async runtime.
    pub async fn register(&self, req: RegisterRequest) -> Result<AuthResponse, ServiceError> {
        if req.username.is_empty() || req.password.is_empty() {
            return Err(ServiceError::BadInput("username and password are required"));
        }
        if req.password.len() > MAX_PASSWORD_LEN {
            return Err(ServiceError::BadInput("password too long"));
        }

        let password = req.password.clone();
        let password_hash = tokio::task::spawn_blocking(move || {
            let salt = SaltString::generate(&mut OsRng);
            Argon2::default()
                .hash_password(password.as_bytes(), &salt)
                .map(|hash| hash.to_string())
        })
        .await
        .map_err(|e| ServiceError::Store(e.into()))?
        .map_err(|e| ServiceError::Store(anyhow::anyhow!("password hashing failed: {e}")))?;

        let user = self
            .db
            .create_user(
                &req.username,
                req.email.as_deref().filter(|s| !s.is_empty()),
                req.phone.as_deref().filter(|s| !s.is_empty()),
                &password_hash,
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    ServiceError::UsernameTaken
                } else {
                    ServiceError::Store(e)
                }
            })?;

        let token = self.mint_token(&user)?;
        Ok(AuthResponse { token, user })
    }

    /// Verify credentials and mint a token. The same error covers an
    /// unknown username and a wrong password.
    pub async fn login(&self, req: LoginRequest) -> Result<AuthResponse, ServiceError> {
        if req.password.len() > MAX_PASSWORD_LEN {
            return Err(ServiceError::InvalidCredentials);
        }

        let user = self
            .db
            .get_user_by_username(&req.username)?
            .ok_or(ServiceError::InvalidCredentials)?;

        let password = req.password;
        let stored_hash = user.password_hash.clone();
        let verified = tokio::task::spawn_blocking(move || {
            let Ok(parsed) = PasswordHash::new(&stored_hash) else {
                return false;
            };
            Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok()
        })
        .await
        .map_err(|e| ServiceError::Store(e.into()))?;

        if !verified {
            return Err(ServiceError::InvalidCredentials);
        }

        let token = self.mint_token(&user)?;
        Ok(AuthResponse { token, user })
    }

    pub fn mint_token(&self, user: &User) -> Result<String, ServiceError> {
        let now = chrono::Utc::now();
        let claims = Claims {
            user_id: user.id,
            username: user.username.clone(),
            exp: (now + chrono::Duration::from_std(self.jwt_expiry).unwrap_or_default())
                .timestamp() as usize,
            iat: now.timestamp() as usize,
        };

        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.jwt_secret.as_bytes()),
        )
        .map_err(|e| ServiceError::Store(e.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{decode, DecodingKey, Validation};

    fn service() -> AuthService {
        let db = Arc::new(Database::open_in_memory().unwrap());
        AuthService::new(db, "test-secret".into(), Duration::from_secs(3600))
    }

    fn register_req(username: &str) -> RegisterRequest {
        RegisterRequest {
            username: username.into(),
            email: None,
            phone: None,
            password: "correct horse battery".into(),
        }
    }

    #[tokio::test]
    async fn register_then_login_round_trip() {
        let auth = service();

        let registered = auth.register(register_req("ada")).await.unwrap();
        assert!(!registered.token.is_empty());
        assert_eq!(registered.user.username, "ada");

        let logged_in = auth
            .login(LoginRequest {
                username: "ada".into(),
                password: "correct horse battery".into(),
            })
            .await
            .unwrap();
        assert_eq!(logged_in.user.id, registered.user.id);

        let claims = decode::<Claims>(
            &logged_in.token,
            &DecodingKey::from_secret("test-secret".as_bytes()),
            &Validation::default(),
        )
        .unwrap()
        .claims;
        assert_eq!(claims.user_id, registered.user.id);
        assert_eq!(claims.username, "ada");
    }

    #[tokio::test]
    async fn duplicate_username_is_rejected() {
        let auth = service();
        auth.register(register_req("ada")).await.unwrap();

        let err = auth.register(register_req("ada")).await.unwrap_err();
        assert!(matches!(err, ServiceError::UsernameTaken));
    }

    #[tokio::test]
    async fn wrong_password_and_unknown_user_fail_alike() {
        let auth = service();
        auth.register(register_req("ada")).await.unwrap();

        let wrong_password = auth
            .login(LoginRequest {
                username: "ada".into(),
                password: "nope".into(),
            })
            .await
            .unwrap_err();
        let unknown_user = auth
            .login(LoginRequest {
                username: "ghost".into(),
                password: "nope".into(),
            })
            .await
            .unwrap_err();

        assert_eq!(wrong_password.to_string(), unknown_user.to_string());
    }
}
