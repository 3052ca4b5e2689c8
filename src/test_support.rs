//! On-disk fixtures shaped like an OpenCode data root

use std::fs;
use std::path::{Path, PathBuf};

pub fn session_dir(root: &Path) -> PathBuf {
    root.join("storage").join("session")
}

pub fn message_dir(root: &Path, session_id: &str) -> PathBuf {
    root.join("storage").join("message").join(session_id)
}

pub fn write_session(root: &Path, project: &str, id: &str, title: &str, created: i64) -> PathBuf {
    let dir = session_dir(root).join(project);
    fs::create_dir_all(&dir).unwrap();
    let path = dir.join(format!("{}.json", id));
    fs::write(
        &path,
        format!(
            r#"{{"id":"{}","title":"{}","time":{{"created":{},"updated":{}}}}}"#,
            id,
            title,
            created,
            created + 1
        ),
    )
    .unwrap();
    path
}

#[allow(clippy::too_many_arguments)]
pub fn write_assistant(
    root: &Path,
    session_id: &str,
    msg_id: &str,
    created: i64,
    provider: &str,
    model: &str,
    input: u64,
    output: u64,
    cost: f64,
) -> PathBuf {
    write_message_json(
        root,
        session_id,
        msg_id,
        &format!(
            r#"{{"id":"{msg_id}","role":"assistant","sessionID":"{session_id}","time":{{"created":{created}}},
               "providerID":"{provider}","modelID":"{model}",
               "tokens":{{"input":{input},"output":{output},"reasoning":0,"cache":{{"write":0,"read":0}}}},
               "cost":{cost}}}"#
        ),
    )
}

pub fn write_user(root: &Path, session_id: &str, msg_id: &str, created: i64, content: &str) -> PathBuf {
    write_message_json(
        root,
        session_id,
        msg_id,
        &format!(
            r#"{{"id":"{msg_id}","role":"user","sessionID":"{session_id}","time":{{"created":{created}}},"content":"{content}"}}"#
        ),
    )
}

pub fn write_message_json(root: &Path, session_id: &str, msg_id: &str, json: &str) -> PathBuf {
    let dir = message_dir(root, session_id);
    fs::create_dir_all(&dir).unwrap();
    let path = dir.join(format!("{}.json", msg_id));
    fs::write(&path, json).unwrap();
    path
}

/// Set a file's mtime to an exact epoch-millis value
pub fn set_mtime(path: &Path, ms: i64) {
    let time = std::time::UNIX_EPOCH + std::time::Duration::from_millis(ms as u64);
    let file = fs::File::options().write(true).open(path).unwrap();
    file.set_modified(time).unwrap();
}
