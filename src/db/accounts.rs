//! Account roles

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use super::CatalogDb;
use crate::capabilities::RoleStore;
use crate::error::CatalogError;
use crate::models::{Role, UserId};

pub fn get_role(conn: &Connection, user_id: UserId) -> Result<Option<Role>, CatalogError> {
    let role: Option<String> = conn
        .query_row(
            "SELECT role FROM accounts WHERE user_id = ?",
            params![user_id],
            |row| row.get(0),
        )
        .optional()?;

    role.map(|r| {
        Role::from_db_str(&r).ok_or_else(|| {
            CatalogError::Storage(format!("account {} has unknown role '{}'", user_id, r))
        })
    })
    .transpose()
}

pub fn set_role(conn: &Connection, user_id: UserId, role: Role) -> Result<(), CatalogError> {
    conn.execute(
        r#"
        INSERT INTO accounts (user_id, role, updated_at) VALUES (?, ?, ?)
        ON CONFLICT (user_id) DO UPDATE SET role = excluded.role, updated_at = excluded.updated_at
        "#,
        params![user_id, role.as_str(), Utc::now()],
    )?;
    Ok(())
}

impl RoleStore for CatalogDb {
    fn role_of(&self, user_id: UserId) -> Result<Role, CatalogError> {
        self.with_conn(|conn| Ok(get_role(conn, user_id)?.unwrap_or_default()))
    }
}
