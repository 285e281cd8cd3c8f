use rand::RngCore;
use rusqlite::{params, Connection, OptionalExtension};

/// Create a new session for an account. Returns the session token.
pub fn create_session(conn: &Connection, uid: &str, hours: u64) -> Result<String, rusqlite::Error> {
    let token = generate_token();
    let id = uuid::Uuid::now_v7().to_string();

    conn.execute(
        "INSERT INTO sessions (id, uid, token, expires_at) VALUES (?1, ?2, ?3, datetime('now', ?4))",
        params![id, uid, token, format!("+{} hours", hours)],
    )?;

    Ok(token)
}

/// Account behind a live session token.
pub fn resolve_session(conn: &Connection, token: &str) -> Result<Option<String>, rusqlite::Error> {
    conn.query_row(
        "SELECT uid FROM sessions WHERE token = ?1 AND expires_at > datetime('now')",
        params![token],
        |row| row.get(0),
    )
    .optional()
}

/// Delete a session by token.
pub fn delete_session(conn: &Connection, token: &str) -> Result<(), rusqlite::Error> {
    conn.execute("DELETE FROM sessions WHERE token = ?1", params![token])?;
    Ok(())
}

pub fn purge_expired(conn: &Connection) -> Result<usize, rusqlite::Error> {
    conn.execute(
        "DELETE FROM sessions WHERE expires_at <= datetime('now')",
        [],
    )
}

/// Generate a cryptographically random 32-byte hex token.
fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
