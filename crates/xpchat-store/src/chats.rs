use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use xpchat_shared::types::{ChatId, UserId};

use crate::database::{conversion_error, parse_ts, Database};
use crate::error::Result;
use crate::models::{Chat, ChatType, ParticipantRole};

impl Database {
    pub fn create_chat(
        &self,
        id: ChatId,
        name: Option<String>,
        chat_type: ChatType,
        created_by: Option<&UserId>,
    ) -> Result<Chat> {
        let chat = Chat {
            id,
            name,
            chat_type,
            created_by: created_by.cloned(),
            created_at: Utc::now(),
        };

        self.conn().execute(
            "INSERT INTO chats (id, name, chat_type, created_by, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                chat.id.as_str(),
                chat.name,
                chat.chat_type.as_str(),
                chat.created_by.as_ref().map(|u| u.as_str()),
                chat.created_at.to_rfc3339(),
            ],
        )?;
        Ok(chat)
    }

    pub fn get_chat(&self, id: &ChatId) -> Result<Option<Chat>> {
        let chat = self
            .conn()
            .query_row(
                "SELECT id, name, chat_type, created_by, created_at FROM chats WHERE id = ?1",
                params![id.as_str()],
                row_to_chat,
            )
            .optional()?;
        Ok(chat)
    }

    /// Add (or re-role) a participant.
    pub fn add_chat_participant(
        &self,
        chat_id: &ChatId,
        user_id: &UserId,
        role: ParticipantRole,
    ) -> Result<()> {
        self.conn().execute(
            "INSERT INTO chat_participants (chat_id, user_id, role, joined_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(chat_id, user_id) DO UPDATE SET role = excluded.role",
            params![
                chat_id.as_str(),
                user_id.as_str(),
                role.as_str(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn chat_participants(&self, chat_id: &ChatId) -> Result<Vec<UserId>> {
        let mut stmt = self.conn().prepare(
            "SELECT user_id FROM chat_participants WHERE chat_id = ?1 ORDER BY joined_at",
        )?;
        let rows = stmt.query_map(params![chat_id.as_str()], |row| {
            row.get::<_, String>(0).map(UserId)
        })?;

        let mut users = Vec::new();
        for row in rows {
            users.push(row?);
        }
        Ok(users)
    }

    pub fn get_user_chats(&self, user_id: &UserId) -> Result<Vec<Chat>> {
        let mut stmt = self.conn().prepare(
            "SELECT c.id, c.name, c.chat_type, c.created_by, c.created_at
             FROM chats c
             JOIN chat_participants p ON p.chat_id = c.id
             WHERE p.user_id = ?1
             ORDER BY c.created_at DESC",
        )?;
        let rows = stmt.query_map(params![user_id.as_str()], row_to_chat)?;

        let mut chats = Vec::new();
        for row in rows {
            chats.push(row?);
        }
        Ok(chats)
    }
}

fn row_to_chat(row: &rusqlite::Row<'_>) -> rusqlite::Result<Chat> {
    let id: String = row.get(0)?;
    let type_str: String = row.get(2)?;
    let created_by: Option<String> = row.get(3)?;
    let created_at: String = row.get(4)?;

    let chat_type = ChatType::parse(&type_str)
        .ok_or_else(|| conversion_error(2, format!("unknown chat type '{type_str}'")))?;

    Ok(Chat {
        id: ChatId(id),
        name: row.get(1)?,
        chat_type,
        created_by: created_by.map(UserId),
        created_at: parse_ts(4, &created_at)?,
    })
}
