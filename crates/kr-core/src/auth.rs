//! Authentication core (§4.10).
//!
//! Entities and role-hierarchy primitives only. Resolving a request's
//! credentials from an admin-secret header, session cookie, or bearer token
//! is HTTP middleware concern and lives in `kr-host`; this module owns the
//! entities those header/cookie values ultimately resolve to, plus password
//! and token hashing.
//!
//! Grounded on the teacher's `AppRoleStore` (`vaultrs-core/src/approle.rs`):
//! an `RwLock`-cached table per entity kind, persisted through the
//! [`Store`]. Unlike AppRole's stored-secret-id-hash model, API tokens here
//! are also hashed before storage (SHA3-512, not SHA-256) but the adaptation
//! stops there — sessions and invitations have no AppRole analogue and are
//! modeled directly from §4.10.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_512};
use tokio::sync::RwLock;
use tracing::info;

use crate::error::AuthError;
use crate::store::Store;

const USER_PREFIX: &str = "auth/users/";
const SESSION_PREFIX: &str = "auth/sessions/";
const TOKEN_PREFIX: &str = "auth/tokens/";
const INVITATION_PREFIX: &str = "auth/invitations/";
const GROUP_PREFIX: &str = "auth/groups/";
const VPS_ASSIGNMENT_PREFIX: &str = "auth/vps_assignments/";

fn user_key(username: &str) -> String {
    format!("{USER_PREFIX}{username}")
}
fn session_key(id: &str) -> String {
    format!("{SESSION_PREFIX}{id}")
}
fn token_key(hash: &str) -> String {
    format!("{TOKEN_PREFIX}{hash}")
}
fn invitation_key(token: &str) -> String {
    format!("{INVITATION_PREFIX}{token}")
}
fn group_key(name: &str) -> String {
    format!("{GROUP_PREFIX}{name}")
}
fn vps_assignment_key(task_id: u64) -> String {
    format!("{VPS_ASSIGNMENT_PREFIX}{task_id}")
}

/// Five-level role hierarchy, `anony < viewer < user < operator < admin`,
/// compared by index (§4.10).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Role {
    Anony,
    Viewer,
    User,
    Operator,
    Admin,
}

impl Role {
    /// Whether this role satisfies a `minimum` requirement.
    #[must_use]
    pub fn satisfies(self, minimum: Role) -> bool {
        self >= minimum
    }
}

/// A registered user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    pub password_hash: String,
    pub role: Role,
    pub active: bool,
    pub group: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A server-side session row. Expiry is checked on every use; expired rows
/// are deleted on access, not by a background sweep (§4.10).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub username: String,
    pub expires_at: DateTime<Utc>,
}

/// An API token. Only the SHA3-512 hash of the token is ever persisted;
/// the plaintext is returned to the caller exactly once, on creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiToken {
    pub token_hash: String,
    pub username: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

/// An invitation: role, optional group binding, max-usage and expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invitation {
    pub token: String,
    pub role: Role,
    pub group: Option<String>,
    pub max_uses: u32,
    pub use_count: u32,
    pub expires_at: DateTime<Utc>,
}

impl Invitation {
    fn is_valid(&self, now: DateTime<Utc>) -> bool {
        self.use_count < self.max_uses && self.expires_at > now
    }
}

/// A group with a tier and JSON-encoded quota document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub name: String,
    pub tier: String,
    pub quotas: serde_json::Value,
}

/// Grants a user access to a VPS task beyond its owner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VpsAssignment {
    pub task_id: u64,
    pub owner: String,
    pub assigned_users: Vec<String>,
}

impl VpsAssignment {
    /// Whether `username` with `role` may access this VPS (§4.10: "granted
    /// only to the owner, assigned users, or operators/admins").
    #[must_use]
    pub fn grants_access(&self, username: &str, role: Role) -> bool {
        role.satisfies(Role::Operator) || self.owner == username || self.assigned_users.iter().any(|u| u == username)
    }
}

/// Authentication and authorization store.
pub struct AuthCore {
    store: Store,
    users: RwLock<HashMap<String, User>>,
    sessions: RwLock<HashMap<String, Session>>,
    tokens: RwLock<HashMap<String, ApiToken>>,
    invitations: RwLock<HashMap<String, Invitation>>,
    groups: RwLock<HashMap<String, Group>>,
    vps_assignments: RwLock<HashMap<u64, VpsAssignment>>,
}

impl AuthCore {
    /// Load every auth table from the store at startup.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Store`] if the store fails.
    pub async fn load(store: Store) -> Result<Self, AuthError> {
        let users = store
            .list_values::<User>(USER_PREFIX)
            .await?
            .into_iter()
            .map(|u| (u.username.clone(), u))
            .collect();
        let sessions = store
            .list_values::<Session>(SESSION_PREFIX)
            .await?
            .into_iter()
            .map(|s| (s.id.clone(), s))
            .collect();
        let tokens = store
            .list_values::<ApiToken>(TOKEN_PREFIX)
            .await?
            .into_iter()
            .map(|t| (t.token_hash.clone(), t))
            .collect();
        let invitations = store
            .list_values::<Invitation>(INVITATION_PREFIX)
            .await?
            .into_iter()
            .map(|i| (i.token.clone(), i))
            .collect();
        let groups = store
            .list_values::<Group>(GROUP_PREFIX)
            .await?
            .into_iter()
            .map(|g| (g.name.clone(), g))
            .collect();
        let vps_assignments = store
            .list_values::<VpsAssignment>(VPS_ASSIGNMENT_PREFIX)
            .await?
            .into_iter()
            .map(|a| (a.task_id, a))
            .collect();
        Ok(Self {
            store,
            users: RwLock::new(users),
            sessions: RwLock::new(sessions),
            tokens: RwLock::new(tokens),
            invitations: RwLock::new(invitations),
            groups: RwLock::new(groups),
            vps_assignments: RwLock::new(vps_assignments),
        })
    }

    /// Register a new user by consuming an invitation.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvitationInvalid`] if the invitation is
    /// expired, exhausted, or unknown; [`AuthError::UsernameTaken`] if the
    /// username is already registered; [`AuthError::Bcrypt`] if hashing
    /// fails.
    pub async fn register(
        &self,
        username: &str,
        password: &str,
        invitation_token: &str,
    ) -> Result<User, AuthError> {
        let mut invitations = self.invitations.write().await;
        let invitation = invitations
            .get_mut(invitation_token)
            .filter(|inv| inv.is_valid(Utc::now()))
            .ok_or(AuthError::InvitationInvalid)?;

        {
            let users = self.users.read().await;
            if users.contains_key(username) {
                return Err(AuthError::UsernameTaken {
                    username: username.to_owned(),
                });
            }
        }

        let password_hash = bcrypt::hash(password, bcrypt::DEFAULT_COST)?;
        let user = User {
            username: username.to_owned(),
            password_hash,
            role: invitation.role,
            active: true,
            group: invitation.group.clone(),
            created_at: Utc::now(),
        };
        self.store.put(&user_key(username), &user).await?;
        self.users
            .write()
            .await
            .insert(username.to_owned(), user.clone());

        invitation.use_count += 1;
        self.store
            .put(&invitation_key(invitation_token), &invitation)
            .await?;

        info!(username, "user registered");
        Ok(user)
    }

    /// Verify a username/password pair and start a session.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidCredentials`] if the user is unknown,
    /// inactive, or the password doesn't match.
    pub async fn login(&self, username: &str, password: &str) -> Result<Session, AuthError> {
        let user = {
            let users = self.users.read().await;
            users
                .get(username)
                .cloned()
                .filter(|u| u.active)
                .ok_or(AuthError::InvalidCredentials)?
        };

        let matches = bcrypt::verify(password, &user.password_hash)?;
        if !matches {
            return Err(AuthError::InvalidCredentials);
        }

        let session = Session {
            id: random_token(),
            username: username.to_owned(),
            expires_at: Utc::now() + chrono::Duration::hours(24),
        };
        self.store.put(&session_key(&session.id), &session).await?;
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session.clone());
        Ok(session)
    }

    /// Validate a session id, deleting it if expired.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Unauthorized`] if the session is unknown or
    /// expired.
    pub async fn validate_session(&self, session_id: &str) -> Result<User, AuthError> {
        let expired = {
            let sessions = self.sessions.read().await;
            match sessions.get(session_id) {
                Some(s) => s.expires_at <= Utc::now(),
                None => return Err(AuthError::Unauthorized),
            }
        };

        if expired {
            self.sessions.write().await.remove(session_id);
            self.store.delete(&session_key(session_id)).await?;
            return Err(AuthError::Unauthorized);
        }

        let username = self
            .sessions
            .read()
            .await
            .get(session_id)
            .map(|s| s.username.clone())
            .ok_or(AuthError::Unauthorized)?;
        self.users
            .read()
            .await
            .get(&username)
            .cloned()
            .ok_or(AuthError::Unauthorized)
    }

    /// Delete a session (logout).
    pub async fn logout(&self, session_id: &str) -> Result<(), AuthError> {
        self.sessions.write().await.remove(session_id);
        self.store.delete(&session_key(session_id)).await?;
        Ok(())
    }

    /// Issue a new API token for `username`. Returns the plaintext token;
    /// only its hash is persisted.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Store`] if persistence fails.
    pub async fn issue_token(&self, username: &str, name: &str) -> Result<String, AuthError> {
        let plaintext = random_token();
        let hash = hash_token(&plaintext);
        let token = ApiToken {
            token_hash: hash.clone(),
            username: username.to_owned(),
            name: name.to_owned(),
            created_at: Utc::now(),
            last_used_at: None,
        };
        self.store.put(&token_key(&hash), &token).await?;
        self.tokens.write().await.insert(hash, token);
        Ok(plaintext)
    }

    /// Validate a bearer token, updating its `last_used_at`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Unauthorized`] if the token is unknown.
    pub async fn validate_token(&self, plaintext: &str) -> Result<User, AuthError> {
        let hash = hash_token(plaintext);
        let username = {
            let mut tokens = self.tokens.write().await;
            let token = tokens.get_mut(&hash).ok_or(AuthError::Unauthorized)?;
            token.last_used_at = Some(Utc::now());
            token.username.clone()
        };
        if let Some(token) = self.tokens.read().await.get(&hash) {
            self.store.put(&token_key(&hash), token).await?;
        }
        self.users
            .read()
            .await
            .get(&username)
            .cloned()
            .ok_or(AuthError::Unauthorized)
    }

    /// Revoke an API token by its plaintext value.
    pub async fn revoke_token(&self, plaintext: &str) -> Result<(), AuthError> {
        let hash = hash_token(plaintext);
        self.tokens.write().await.remove(&hash);
        self.store.delete(&token_key(&hash)).await?;
        Ok(())
    }

    /// Create an invitation. An operator may only issue viewer-level
    /// invitations (§4.10); callers pass the issuer's role for that check.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Forbidden`] if `issuer_role` is `Operator` and
    /// `role` is above `Viewer`.
    pub async fn create_invitation(
        &self,
        issuer_role: Role,
        role: Role,
        group: Option<String>,
        max_uses: u32,
        ttl: chrono::Duration,
    ) -> Result<Invitation, AuthError> {
        if issuer_role == Role::Operator && role > Role::Viewer {
            return Err(AuthError::Forbidden);
        }
        let invitation = Invitation {
            token: random_token(),
            role,
            group,
            max_uses,
            use_count: 0,
            expires_at: Utc::now() + ttl,
        };
        self.store
            .put(&invitation_key(&invitation.token), &invitation)
            .await?;
        self.invitations
            .write()
            .await
            .insert(invitation.token.clone(), invitation.clone());
        Ok(invitation)
    }

    /// Change a user's role, active flag, or delete them, enforcing
    /// self-protection (invariant 6: admins may not demote, disable, or
    /// delete themselves).
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::SelfProtection`] if `actor_username == target`
    /// and the target is an admin.
    pub async fn set_role(
        &self,
        actor_username: &str,
        target_username: &str,
        new_role: Role,
    ) -> Result<(), AuthError> {
        self.guard_self_protection(actor_username, target_username, "demote")
            .await?;
        self.mutate_user(target_username, |u| u.role = new_role).await
    }

    /// Enable or disable a user, enforcing self-protection.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::SelfProtection`] if disabling oneself as admin.
    pub async fn set_active(
        &self,
        actor_username: &str,
        target_username: &str,
        active: bool,
    ) -> Result<(), AuthError> {
        if !active {
            self.guard_self_protection(actor_username, target_username, "disable")
                .await?;
        }
        self.mutate_user(target_username, |u| u.active = active).await
    }

    /// Delete a user, enforcing self-protection.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::SelfProtection`] if deleting oneself as admin.
    pub async fn delete_user(
        &self,
        actor_username: &str,
        target_username: &str,
    ) -> Result<(), AuthError> {
        self.guard_self_protection(actor_username, target_username, "delete")
            .await?;
        self.users.write().await.remove(target_username);
        self.store.delete(&user_key(target_username)).await?;
        Ok(())
    }

    async fn guard_self_protection(
        &self,
        actor_username: &str,
        target_username: &str,
        action: &'static str,
    ) -> Result<(), AuthError> {
        if actor_username != target_username {
            return Ok(());
        }
        let is_admin = self
            .users
            .read()
            .await
            .get(target_username)
            .is_some_and(|u| u.role == Role::Admin);
        if is_admin {
            Err(AuthError::SelfProtection { action })
        } else {
            Ok(())
        }
    }

    async fn mutate_user(
        &self,
        username: &str,
        f: impl FnOnce(&mut User),
    ) -> Result<(), AuthError> {
        let mut users = self.users.write().await;
        let user = users
            .get_mut(username)
            .ok_or_else(|| AuthError::NotFound {
                what: format!("user '{username}'"),
            })?;
        f(user);
        self.store.put(&user_key(username), user).await?;
        Ok(())
    }

    /// Record or update a VPS assignment table entry.
    pub async fn set_vps_assignment(&self, assignment: VpsAssignment) -> Result<(), AuthError> {
        self.store
            .put(&vps_assignment_key(assignment.task_id), &assignment)
            .await?;
        self.vps_assignments
            .write()
            .await
            .insert(assignment.task_id, assignment);
        Ok(())
    }

    /// Fetch a VPS assignment, if one exists for this task.
    pub async fn get_vps_assignment(&self, task_id: u64) -> Option<VpsAssignment> {
        self.vps_assignments.read().await.get(&task_id).cloned()
    }

    /// Create or update a group.
    pub async fn put_group(&self, group: Group) -> Result<(), AuthError> {
        self.store.put(&group_key(&group.name), &group).await?;
        self.groups.write().await.insert(group.name.clone(), group);
        Ok(())
    }

    /// Fetch a user by username.
    pub async fn get_user(&self, username: &str) -> Option<User> {
        self.users.read().await.get(username).cloned()
    }
}

impl std::fmt::Debug for AuthCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthCore").finish_non_exhaustive()
    }
}

fn random_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn hash_token(plaintext: &str) -> String {
    let mut hasher = Sha3_512::new();
    hasher.update(plaintext.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use kr_storage::MemoryBackend;
    use std::sync::Arc;

    async fn make_core() -> AuthCore {
        AuthCore::load(Store::new(Arc::new(MemoryBackend::new())))
            .await
            .unwrap()
    }

    #[test]
    fn role_ordering_matches_hierarchy() {
        assert!(Role::Admin > Role::Operator);
        assert!(Role::Operator > Role::User);
        assert!(Role::User > Role::Viewer);
        assert!(Role::Viewer > Role::Anony);
        assert!(Role::User.satisfies(Role::Viewer));
        assert!(!Role::Viewer.satisfies(Role::User));
    }

    #[tokio::test]
    async fn register_consumes_invitation_and_rejects_reuse_past_max() {
        let core = make_core().await;
        let invitation = core
            .create_invitation(Role::Admin, Role::User, None, 1, chrono::Duration::hours(1))
            .await
            .unwrap();

        core.register("alice", "hunter2", &invitation.token)
            .await
            .unwrap();

        let err = core
            .register("bob", "hunter2", &invitation.token)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvitationInvalid));
    }

    #[tokio::test]
    async fn operator_cannot_issue_above_viewer_invitation() {
        let core = make_core().await;
        let err = core
            .create_invitation(Role::Operator, Role::Admin, None, 1, chrono::Duration::hours(1))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Forbidden));
    }

    #[tokio::test]
    async fn login_with_wrong_password_is_rejected() {
        let core = make_core().await;
        let invitation = core
            .create_invitation(Role::Admin, Role::User, None, 1, chrono::Duration::hours(1))
            .await
            .unwrap();
        core.register("alice", "correct-horse", &invitation.token)
            .await
            .unwrap();

        let err = core.login("alice", "wrong").await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredentials));
    }

    #[tokio::test]
    async fn login_then_validate_session_roundtrips() {
        let core = make_core().await;
        let invitation = core
            .create_invitation(Role::Admin, Role::User, None, 1, chrono::Duration::hours(1))
            .await
            .unwrap();
        core.register("alice", "correct-horse", &invitation.token)
            .await
            .unwrap();

        let session = core.login("alice", "correct-horse").await.unwrap();
        let user = core.validate_session(&session.id).await.unwrap();
        assert_eq!(user.username, "alice");
    }

    #[tokio::test]
    async fn expired_session_is_rejected_and_deleted() {
        let core = make_core().await;
        let invitation = core
            .create_invitation(Role::Admin, Role::User, None, 1, chrono::Duration::hours(1))
            .await
            .unwrap();
        core.register("alice", "correct-horse", &invitation.token)
            .await
            .unwrap();
        let session = core.login("alice", "correct-horse").await.unwrap();

        {
            let mut sessions = core.sessions.write().await;
            sessions.get_mut(&session.id).unwrap().expires_at = Utc::now() - chrono::Duration::seconds(1);
        }

        let err = core.validate_session(&session.id).await.unwrap_err();
        assert!(matches!(err, AuthError::Unauthorized));
        assert!(core.sessions.read().await.get(&session.id).is_none());
    }

    #[tokio::test]
    async fn issue_token_then_validate_roundtrips() {
        let core = make_core().await;
        let invitation = core
            .create_invitation(Role::Admin, Role::User, None, 1, chrono::Duration::hours(1))
            .await
            .unwrap();
        core.register("alice", "correct-horse", &invitation.token)
            .await
            .unwrap();

        let plaintext = core.issue_token("alice", "ci").await.unwrap();
        let user = core.validate_token(&plaintext).await.unwrap();
        assert_eq!(user.username, "alice");

        core.revoke_token(&plaintext).await.unwrap();
        let err = core.validate_token(&plaintext).await.unwrap_err();
        assert!(matches!(err, AuthError::Unauthorized));
    }

    #[tokio::test]
    async fn admin_cannot_demote_or_disable_or_delete_self() {
        let core = make_core().await;
        let invitation = core
            .create_invitation(Role::Admin, Role::Admin, None, 1, chrono::Duration::hours(1))
            .await
            .unwrap();
        core.register("root", "correct-horse", &invitation.token)
            .await
            .unwrap();

        assert!(matches!(
            core.set_role("root", "root", Role::User).await.unwrap_err(),
            AuthError::SelfProtection { action: "demote" }
        ));
        assert!(matches!(
            core.set_active("root", "root", false).await.unwrap_err(),
            AuthError::SelfProtection { action: "disable" }
        ));
        assert!(matches!(
            core.delete_user("root", "root").await.unwrap_err(),
            AuthError::SelfProtection { action: "delete" }
        ));
    }

    #[tokio::test]
    async fn vps_assignment_grants_access_to_owner_assignees_and_operators() {
        let assignment = VpsAssignment {
            task_id: 1,
            owner: "alice".to_owned(),
            assigned_users: vec!["bob".to_owned()],
        };
        assert!(assignment.grants_access("alice", Role::User));
        assert!(assignment.grants_access("bob", Role::User));
        assert!(assignment.grants_access("carol", Role::Operator));
        assert!(!assignment.grants_access("carol", Role::User));
    }
}
