//! The read collaborator: once a downloaded artifact is readable, copy it
//! into scratch and run a read-only query against its known schema.

use std::fs;
use std::io;
use std::path::Path;

use rusqlite::{Connection, OpenFlags};
use thiserror::Error;
use tracing::info;

use crate::config::Extractor;
use crate::descriptor::{DescriptorError, ScratchDir};

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("failed to copy artifact: {0}")]
    Copy(#[from] io::Error),
    #[error(transparent)]
    Scratch(#[from] DescriptorError),
    #[error("failed to open database: {0}")]
    Open(rusqlite::Error),
    #[error("query failed: {0}")]
    Query(rusqlite::Error),
}

const CHAT_QUERY: &str = "\
SELECT
    h.id, m.account
FROM message AS m
    LEFT JOIN handle AS h ON m.handle_id = h.rowid
WHERE m.text != '' AND h.id != ''
ORDER BY m.date DESC
LIMIT 5;";

const NICKNAME_QUERY: &str = "SELECT key FROM kvtable;";

/// Runs the extractor's query against `artifact`, which must be readable by
/// the time this is called.
pub fn read_artifact(
    scratch: &ScratchDir,
    artifact: &Path,
    extractor: Extractor,
) -> Result<(), ExtractError> {
    match extractor {
        Extractor::Chat => read_chat(scratch, artifact),
        Extractor::Nicknames => read_nicknames(scratch, artifact),
    }
}

fn open_copy(
    scratch: &ScratchDir,
    artifact: &Path,
    name: &str,
) -> Result<Connection, ExtractError> {
    // Copy first: the artifact sits in the transfer service's cache and may
    // be overwritten by the next download.
    let local = scratch.stage(name)?;
    fs::copy(artifact, &local)?;
    Connection::open_with_flags(&local, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .map_err(ExtractError::Open)
}

fn read_chat(scratch: &ScratchDir, artifact: &Path) -> Result<(), ExtractError> {
    let db = open_copy(scratch, artifact, "user-chat.db")?;
    let mut statement = db.prepare(CHAT_QUERY).map_err(ExtractError::Query)?;
    let rows = statement
        .query_map([], |row| {
            let sender: Option<String> = row.get(0)?;
            let account: Option<String> = row.get(1)?;
            Ok((sender.unwrap_or_default(), account.unwrap_or_default()))
        })
        .map_err(ExtractError::Query)?;

    info!("last five messages received (as possible):");
    for row in rows {
        let (sender, account) = row.map_err(ExtractError::Query)?;
        info!(%sender, %account, "💬 message");
    }
    Ok(())
}

fn read_nicknames(scratch: &ScratchDir, artifact: &Path) -> Result<(), ExtractError> {
    let db = open_copy(scratch, artifact, "nicknames.db")?;
    let mut statement = db.prepare(NICKNAME_QUERY).map_err(ExtractError::Query)?;
    let rows = statement
        .query_map([], |row| {
            let key: Option<String> = row.get(0)?;
            Ok(key.unwrap_or_default())
        })
        .map_err(ExtractError::Query)?;

    info!("known associates of user (possibly empty):");
    for row in rows {
        let handle = row.map_err(ExtractError::Query)?;
        info!(%handle, "👤 associate");
    }
    Ok(())
}
