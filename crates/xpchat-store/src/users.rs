use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use xpchat_shared::types::{PresenceStatus, UserId};

use crate::database::{conversion_error, parse_opt_ts, parse_ts, Database};
use crate::error::{Result, StoreError};
use crate::models::{NewUser, User};

const USER_COLUMNS: &str = "id, username, avatar, status, last_seen, created_at";

impl Database {
    pub fn create_user(&self, new_user: &NewUser) -> Result<User> {
        let user = User {
            id: new_user.id.clone(),
            username: new_user.username.clone(),
            avatar: new_user.avatar.clone(),
            status: PresenceStatus::Offline,
            last_seen: None,
            created_at: Utc::now(),
        };

        self.conn().execute(
            "INSERT INTO users (id, username, avatar, status, last_seen, created_at)
             VALUES (?1, ?2, ?3, ?4, NULL, ?5)",
            params![
                user.id.as_str(),
                user.username,
                user.avatar,
                user.status.as_str(),
                user.created_at.to_rfc3339(),
            ],
        )?;
        Ok(user)
    }

    pub fn get_user_by_id(&self, id: &UserId) -> Result<Option<User>> {
        let user = self
            .conn()
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
                params![id.as_str()],
                row_to_user,
            )
            .optional()?;
        Ok(user)
    }

    pub fn list_users(&self) -> Result<Vec<User>> {
        let mut stmt = self
            .conn()
            .prepare(&format!("SELECT {USER_COLUMNS} FROM users ORDER BY username"))?;
        let rows = stmt.query_map([], row_to_user)?;

        let mut users = Vec::new();
        for row in rows {
            users.push(row?);
        }
        Ok(users)
    }

    /// Set presence and stamp `last_seen` with the current time.
    pub fn update_user_status(&self, id: &UserId, status: PresenceStatus) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE users SET status = ?1, last_seen = ?2 WHERE id = ?3",
            params![status.as_str(), Utc::now().to_rfc3339(), id.as_str()],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Mark every user offline. Run at startup: no connection survives a restart.
    pub fn reset_presence(&self) -> Result<usize> {
        let affected = self.conn().execute(
            "UPDATE users SET status = 'offline' WHERE status != 'offline'",
            [],
        )?;
        Ok(affected)
    }
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    let id: String = row.get(0)?;
    let status_str: String = row.get(3)?;
    let last_seen: Option<String> = row.get(4)?;
    let created_at: String = row.get(5)?;

    let status = PresenceStatus::parse(&status_str)
        .ok_or_else(|| conversion_error(3, format!("unknown presence status '{status_str}'")))?;

    Ok(User {
        id: UserId(id),
        username: row.get(1)?,
        avatar: row.get(2)?,
        status,
        last_seen: parse_opt_ts(4, last_seen)?,
        created_at: parse_ts(5, &created_at)?,
    })
}
