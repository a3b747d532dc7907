use rusqlite::params;

use xpchat_shared::types::{ChatId, UserId};

use crate::database::{parse_ts, Database};
use crate::error::Result;
use crate::models::Message;

impl Database {
    pub fn insert_message(&self, message: &Message) -> Result<()> {
        self.conn().execute(
            "INSERT INTO messages (id, chat_id, sender_id, content, message_type,
                                   file_path, file_name, file_size, reply_to, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                message.id,
                message.chat_id.as_str(),
                message.sender_id.as_str(),
                message.content,
                message.message_type,
                message.file_path,
                message.file_name,
                message.file_size,
                message.reply_to,
                message.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Newest first.
    pub fn get_messages_for_chat(
        &self,
        chat_id: &ChatId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, chat_id, sender_id, content, message_type,
                    file_path, file_name, file_size, reply_to, created_at
             FROM messages
             WHERE chat_id = ?1
             ORDER BY created_at DESC
             LIMIT ?2 OFFSET ?3",
        )?;

        let rows = stmt.query_map(params![chat_id.as_str(), limit, offset], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    pub fn delete_message(&self, id: &str) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM messages WHERE id = ?1", params![id])?;
        Ok(affected > 0)
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let chat_id: String = row.get(1)?;
    let sender_id: String = row.get(2)?;
    let created_at: String = row.get(9)?;

    Ok(Message {
        id: row.get(0)?,
        chat_id: ChatId(chat_id),
        sender_id: UserId(sender_id),
        content: row.get(3)?,
        message_type: row.get(4)?,
        file_path: row.get(5)?,
        file_name: row.get(6)?,
        file_size: row.get(7)?,
        reply_to: row.get(8)?,
        created_at: parse_ts(9, &created_at)?,
    })
}
