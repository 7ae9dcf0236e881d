// SPDX-FileCopyrightText: 2023 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The user directory (§4.7, ambient — supplements the distilled spec):
//! `User`, `Application`, and `Session` records backing authentication.
//! Narrowed from the teacher's `auth_service` storage provider trait down
//! to what the handshake and the §6.2 REST façade need.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::errors::DirectoryError;
use crate::identifiers::{AppId, SessionId, UserId};

/// §3: three salts used by the client-side key derivation the server never
/// performs.
#[derive(Clone, Debug)]
pub struct KeySalts {
    pub encryption: Vec<u8>,
    pub diffie_hellman: Vec<u8>,
    pub hmac: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct User {
    pub user_id: UserId,
    pub app_id: AppId,
    pub username: String,
    pub public_key: Vec<u8>,
    pub key_salts: KeySalts,
    pub password_token: Vec<u8>,
    pub encrypted_seed_backup: Vec<u8>,
    pub email: Option<String>,
    pub profile: Option<Vec<u8>>,
    pub deleted: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RememberMe {
    None,
    Session,
    Local,
}

#[derive(Clone, Debug)]
pub struct Session {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub created_at: DateTime<Utc>,
    pub remember_me: RememberMe,
    pub invalidated_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn is_live(&self) -> bool {
        self.invalidated_at.is_none()
    }
}

fn fold_username(app_id: AppId, username: &str) -> (AppId, String) {
    (app_id, username.to_lowercase())
}

/// In-process directory of users and sessions for one server instance.
/// Grounded in the teacher's in-memory `auth_service` storage providers;
/// real deployments would back this with the same store adapter used by
/// the transaction log, keyed by a dedicated partition per app.
#[derive(Default)]
pub struct UserDirectory {
    users_by_id: RwLock<HashMap<UserId, User>>,
    // §3 invariant: username is unique per application tenant, case-folded.
    username_index: RwLock<HashMap<(AppId, String), UserId>>,
    sessions: RwLock<HashMap<SessionId, Session>>,
}

impl UserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create_user(&self, user: User) -> Result<(), DirectoryError> {
        let key = fold_username(user.app_id, &user.username);
        let mut index = self.username_index.write().await;
        if index.contains_key(&key) {
            return Err(DirectoryError::UsernameTaken);
        }
        index.insert(key, user.user_id);
        drop(index);
        self.users_by_id.write().await.insert(user.user_id, user);
        Ok(())
    }

    pub async fn find_by_username(
        &self,
        app_id: AppId,
        username: &str,
    ) -> Result<User, DirectoryError> {
        let key = fold_username(app_id, username);
        let user_id = *self
            .username_index
            .read()
            .await
            .get(&key)
            .ok_or(DirectoryError::UserNotFound)?;
        self.users_by_id
            .read()
            .await
            .get(&user_id)
            .cloned()
            .filter(|u| !u.deleted)
            .ok_or(DirectoryError::UserNotFound)
    }

    pub async fn find_by_id(&self, user_id: UserId) -> Result<User, DirectoryError> {
        self.users_by_id
            .read()
            .await
            .get(&user_id)
            .cloned()
            .filter(|u| !u.deleted)
            .ok_or(DirectoryError::UserNotFound)
    }

    pub async fn update_user(
        &self,
        user_id: UserId,
        f: impl FnOnce(&mut User),
    ) -> Result<User, DirectoryError> {
        let mut users = self.users_by_id.write().await;
        let user = users.get_mut(&user_id).ok_or(DirectoryError::UserNotFound)?;
        f(user);
        Ok(user.clone())
    }

    /// Renames a user, re-checking the §3 per-app username uniqueness
    /// invariant against the new name before releasing the old one.
    pub async fn rename_user(
        &self,
        user_id: UserId,
        new_username: &str,
    ) -> Result<(), DirectoryError> {
        let mut users = self.users_by_id.write().await;
        let user = users.get_mut(&user_id).ok_or(DirectoryError::UserNotFound)?;
        let app_id = user.app_id;
        let old_username = user.username.clone();

        let mut index = self.username_index.write().await;
        let new_key = fold_username(app_id, new_username);
        if index.contains_key(&new_key) {
            return Err(DirectoryError::UsernameTaken);
        }
        index.remove(&fold_username(app_id, &old_username));
        index.insert(new_key, user_id);
        user.username = new_username.to_string();
        Ok(())
    }

    /// §4.3 `DeleteUser`: soft-delete, tearing down the ability to
    /// authenticate while the record (and any referencing logs) remains.
    pub async fn soft_delete_user(&self, user_id: UserId) -> Result<(), DirectoryError> {
        let mut users = self.users_by_id.write().await;
        let user = users.get_mut(&user_id).ok_or(DirectoryError::UserNotFound)?;
        user.deleted = true;
        Ok(())
    }

    /// §3 "one signed-in session per user may be attached to a live
    /// connection at a time": invalidate any prior sessions before handing
    /// out a new one.
    pub async fn create_session(
        &self,
        user_id: UserId,
        remember_me: RememberMe,
        now: DateTime<Utc>,
    ) -> Session {
        let mut sessions = self.sessions.write().await;
        for session in sessions.values_mut() {
            if session.user_id == user_id && session.is_live() {
                session.invalidated_at = Some(now);
            }
        }
        let session = Session {
            session_id: SessionId::random(),
            user_id,
            created_at: now,
            remember_me,
            invalidated_at: None,
        };
        sessions.insert(session.session_id, session.clone());
        session
    }

    pub async fn find_session(&self, session_id: SessionId) -> Result<Session, DirectoryError> {
        let sessions = self.sessions.read().await;
        let session = sessions
            .get(&session_id)
            .ok_or(DirectoryError::SessionNotFound)?;
        if !session.is_live() {
            return Err(DirectoryError::SessionInvalidated);
        }
        Ok(session.clone())
    }

    pub async fn invalidate_session(&self, session_id: SessionId, now: DateTime<Utc>) {
        if let Some(session) = self.sessions.write().await.get_mut(&session_id) {
            session.invalidated_at = Some(now);
        }
    }

    pub async fn invalidate_sessions_for_user(&self, user_id: UserId, now: DateTime<Utc>) {
        let mut sessions = self.sessions.write().await;
        for session in sessions.values_mut() {
            if session.user_id == user_id {
                session.invalidated_at = Some(now);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_user(app_id: AppId, username: &str) -> User {
        User {
            user_id: UserId::random(),
            app_id,
            username: username.to_string(),
            public_key: vec![1, 2, 3],
            key_salts: KeySalts {
                encryption: vec![1],
                diffie_hellman: vec![2],
                hmac: vec![3],
            },
            password_token: vec![4],
            encrypted_seed_backup: vec![5],
            email: None,
            profile: None,
            deleted: false,
        }
    }

    #[tokio::test]
    async fn username_is_unique_per_app_case_folded() {
        let directory = UserDirectory::new();
        let app = AppId::random();
        directory.create_user(sample_user(app, "Alice")).await.unwrap();
        let err = directory
            .create_user(sample_user(app, "alice"))
            .await
            .unwrap_err();
        assert_eq!(err, DirectoryError::UsernameTaken);
    }

    #[tokio::test]
    async fn same_username_allowed_in_different_apps() {
        let directory = UserDirectory::new();
        directory
            .create_user(sample_user(AppId::random(), "alice"))
            .await
            .unwrap();
        directory
            .create_user(sample_user(AppId::random(), "alice"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn new_session_invalidates_prior_live_session() {
        let directory = UserDirectory::new();
        let user_id = UserId::random();
        let now = DateTime::<Utc>::UNIX_EPOCH;
        let first = directory
            .create_session(user_id, RememberMe::Session, now)
            .await;
        let _second = directory
            .create_session(user_id, RememberMe::Session, now)
            .await;

        let err = directory.find_session(first.session_id).await.unwrap_err();
        assert_eq!(err, DirectoryError::SessionInvalidated);
    }

    #[tokio::test]
    async fn soft_deleted_user_is_not_found_by_username() {
        let directory = UserDirectory::new();
        let app = AppId::random();
        let user = sample_user(app, "alice");
        let user_id = user.user_id;
        directory.create_user(user).await.unwrap();
        directory.soft_delete_user(user_id).await.unwrap();
        let err = directory
            .find_by_username(app, "alice")
            .await
            .unwrap_err();
        assert_eq!(err, DirectoryError::UserNotFound);
    }
}
