//! CRUD operations for [`User`] records.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use parley_shared::types::UserId;

use crate::database::{fmt_timestamp, get_id, get_timestamp, Database};
use crate::error::{Result, StoreError};
use crate::models::{ProfileUpdate, User, UserUpsert};

const USER_COLUMNS: &str = "id, external_id, email, first_name, last_name, image, color,
     profile_setup, allow_direct_messages, created_at";

impl Database {
    pub fn get_user(&self, id: UserId) -> Result<Option<User>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1");
        Ok(self
            .conn()
            .query_row(&sql, params![id.to_string()], row_to_user)
            .optional()?)
    }

    pub fn get_user_by_external_id(&self, external_id: &str) -> Result<Option<User>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE external_id = ?1");
        Ok(self
            .conn()
            .query_row(&sql, params![external_id], row_to_user)
            .optional()?)
    }

    /// Fetch many users; ids without a record are skipped.
    pub fn get_users(&self, ids: &[UserId]) -> Result<Vec<User>> {
        let mut users = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(user) = self.get_user(*id)? {
                users.push(user);
            }
        }
        Ok(users)
    }

    /// Insert or update the user identified by the provider subject.
    pub fn upsert_user(&self, upsert: &UserUpsert) -> Result<User> {
        let updated = self.conn().execute(
            "UPDATE users SET email = ?2, first_name = ?3, last_name = ?4, image = ?5
             WHERE external_id = ?1",
            params![
                upsert.external_id,
                upsert.email,
                upsert.first_name,
                upsert.last_name,
                upsert.image,
            ],
        )?;

        if updated == 0 {
            self.conn().execute(
                "INSERT INTO users (id, external_id, email, first_name, last_name, image, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    UserId::new().to_string(),
                    upsert.external_id,
                    upsert.email,
                    upsert.first_name,
                    upsert.last_name,
                    upsert.image,
                    fmt_timestamp(&Utc::now()),
                ],
            )?;
        }

        self.get_user_by_external_id(&upsert.external_id)?
            .ok_or(StoreError::NotFound("User"))
    }

    pub fn delete_user_by_external_id(&self, external_id: &str) -> Result<Option<User>> {
        let Some(user) = self.get_user_by_external_id(external_id)? else {
            return Ok(None);
        };
        self.conn()
            .execute("DELETE FROM users WHERE id = ?1", params![user.id.to_string()])?;
        Ok(Some(user))
    }

    pub fn set_allow_direct_messages(&self, id: UserId, allow: bool) -> Result<User> {
        let affected = self.conn().execute(
            "UPDATE users SET allow_direct_messages = ?2 WHERE id = ?1",
            params![id.to_string(), allow],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound("User"));
        }
        self.get_user(id)?.ok_or(StoreError::NotFound("User"))
    }

    /// All users except `exclude`, oldest account first.
    pub fn list_users_except(&self, exclude: UserId) -> Result<Vec<User>> {
        let sql = format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id != ?1 ORDER BY created_at ASC, rowid ASC"
        );
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(params![exclude.to_string()], row_to_user)?;

        let mut users = Vec::new();
        for row in rows {
            users.push(row?);
        }
        Ok(users)
    }

    /// SQLite's LIKE only folds ASCII, so matching happens on the decoded rows.
    pub fn search_users(&self, exclude: UserId, term: &str) -> Result<Vec<User>> {
        let mut users = self.list_users_except(exclude)?;
        users.retain(|u| u.matches_search(term));
        Ok(users)
    }

    pub fn update_profile(&self, id: UserId, update: &ProfileUpdate) -> Result<User> {
        let affected = self.conn().execute(
            "UPDATE users SET first_name = ?2, last_name = ?3, color = ?4, profile_setup = 1
             WHERE id = ?1",
            params![id.to_string(), update.first_name, update.last_name, update.color],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound("User"));
        }
        self.get_user(id)?.ok_or(StoreError::NotFound("User"))
    }

    pub fn set_user_image(&self, id: UserId, image: Option<&str>) -> Result<User> {
        let affected = self.conn().execute(
            "UPDATE users SET image = ?2 WHERE id = ?1",
            params![id.to_string(), image],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound("User"));
        }
        self.get_user(id)?.ok_or(StoreError::NotFound("User"))
    }
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: get_id(row, 0)?,
        external_id: row.get(1)?,
        email: row.get(2)?,
        first_name: row.get(3)?,
        last_name: row.get(4)?,
        image: row.get(5)?,
        color: row.get(6)?,
        profile_setup: row.get(7)?,
        allow_direct_messages: row.get(8)?,
        created_at: get_timestamp(row, 9)?,
    })
}
