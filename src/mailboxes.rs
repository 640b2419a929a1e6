use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use log::{debug, error, warn};

use crate::error::Error;
use crate::message::Message;
use crate::phone;

/// The single local account messages are filed under.
pub const LOCAL_USER: &str = "local";

const OUTBOX: &str = "outbox";
const INBOX: &str = "inbox";
const THREAD: &str = "thread";

/// A raw received blob, not yet parsed into a [`Message`].
#[derive(Debug, Clone)]
pub struct InboxEntry {
    pub filename: String,
    pub data: Vec<u8>,
}

/// Crash-safe, filesystem-backed mailbox tree.
///
/// Layout under the root:
///
/// ```text
/// <root>/outbox/                      *.json   pending outbound
/// <root>/inbox/                       *.bin    raw received blobs
/// <root>/<local_user>/thread/<peer>/  *.json   per-peer thread
/// ```
///
/// Filenames are UTC timestamps with colons replaced by dots, so a
/// lexicographic listing is a chronological one. Every write goes through
/// a `.tmp` file that is fsynced and renamed over the target; a crash
/// leaves the target either absent or fully written. Filesystem errors
/// are logged and swallowed; the affected file stays put for the next
/// attempt, and the UI never sees an error from the store.
pub struct Mailboxes {
    root: PathBuf,
}

impl Mailboxes {
    pub fn new<P: Into<PathBuf>>(root: P) -> Mailboxes {
        Mailboxes { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Peers the given user has a thread with, sorted.
    pub fn list_recipients(&self, local_user: &str) -> Vec<String> {
        let path = self.threadboxes_path(local_user);
        let entries = match fs::read_dir(&path) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };

        let mut recipients: Vec<String> = entries
            .flatten()
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|name| !name.starts_with('.'))
            .collect();
        recipients.sort();
        recipients
    }

    /// The conversation with `peer`, chronologically sorted.
    ///
    /// Entries whose filename still exists in the outbox get
    /// `not_yet_sent` set.
    pub fn get_thread(&self, local_user: &str, peer: &str) -> Vec<Message> {
        let mut messages = read_mailbox(&self.threadbox_path(local_user, peer));
        let outbox = read_mailbox(&self.outbox_path());

        for (filename, msg) in messages.iter_mut() {
            if outbox.contains_key(filename) {
                msg.not_yet_sent = true;
            }
        }
        messages.into_values().collect()
    }

    /// Delete the whole conversation with `peer`. Errors are logged, not
    /// returned.
    pub fn delete_thread(&self, local_user: &str, peer: &str) {
        let path = self.threadbox_path(local_user, peer);
        if let Err(err) = fs::remove_dir_all(&path) {
            error!("cannot delete {}: {}", path.display(), err);
        }
    }

    /// Queue an outbound message.
    ///
    /// The recipient is normalised first; input that does not sanitise to
    /// a number is dropped with a log line and nothing is written.
    /// Otherwise identical JSON lands in the outbox and in the recipient's
    /// thread under the same timestamped filename.
    pub fn queue_message_send(&self, local_user: &str, recipient: &str, body: &str) {
        let recipient = match phone::normalize(recipient) {
            Some(r) => r,
            None => {
                warn!("dropping message to unparseable recipient {:?}", recipient);
                return;
            }
        };
        self.queue_message_send_at(local_user, &recipient, body, &utcnow_str());
    }

    fn queue_message_send_at(&self, local_user: &str, recipient: &str, body: &str, now: &str) {
        let message = Message {
            local_user: Some(local_user.to_string()),
            recipient: Some(recipient.to_string()),
            timestamp: Some(now.to_string()),
            body: Some(body.to_string()),
            ..Default::default()
        };
        let json = match serde_json::to_vec(&message) {
            Ok(json) => json,
            Err(err) => {
                error!("cannot encode message to {}: {}", recipient, err);
                return;
            }
        };

        let outbox = self.outbox_path();
        let threadbox = self.threadbox_path(local_user, recipient);
        let filename = unique_filename(now, "json", &[&outbox, &threadbox]);

        if let Err(err) = write_atomic(&outbox.join(&filename), &json) {
            error!("failed to write outbox copy of {}: {}", filename, err);
        }
        if let Err(err) = write_atomic(&threadbox.join(&filename), &json) {
            error!("failed to write thread copy of {}: {}", filename, err);
        }
    }

    /// Pending outbound messages, chronologically sorted.
    pub fn read_outbox(&self) -> Vec<Message> {
        read_mailbox(&self.outbox_path()).into_values().collect()
    }

    /// Remove an outbox file after the satellite send succeeded. The
    /// thread copy is untouched.
    pub fn remove_from_outbox(&self, filename: &str) {
        let path = self.outbox_path().join(filename);
        if let Err(err) = fs::remove_file(&path) {
            error!("failed to remove {}: {}", path.display(), err);
        }
    }

    /// Stash a raw received payload in the inbox for later parsing.
    pub fn save_message_to_inbox(&self, data: &[u8]) {
        let inbox = self.inbox_path();
        let filename = unique_filename(&utcnow_str(), "bin", &[&inbox]);
        if let Err(err) = write_atomic(&inbox.join(&filename), data) {
            error!("failed to save received message {}: {}", filename, err);
        }
    }

    /// Parse every inbox blob as `<sender>:<body>` and file it into the
    /// sender's thread. Blobs that parse are deleted; blobs that do not
    /// are logged and left in place. Returns the accepted messages.
    pub fn accept_all_inbox_messages(&self) -> Vec<Message> {
        let mut accepted = Vec::new();

        for entry in self.read_inbox() {
            let (sender, body) = match parse_inbound(&entry.data) {
                Ok(parts) => parts,
                Err(err) => {
                    error!("cannot parse inbox blob {}: {}", entry.filename, err);
                    continue;
                }
            };

            match self.accept_message(&sender, &body) {
                Some(msg) => {
                    self.remove_from_inbox(&entry.filename);
                    accepted.push(msg);
                }
                None => debug!("leaving {} in the inbox for a later pass", entry.filename),
            }
        }
        accepted
    }

    /// Raw inbox blobs, chronologically sorted.
    pub fn read_inbox(&self) -> Vec<InboxEntry> {
        let inbox = self.inbox_path();
        let entries = match fs::read_dir(&inbox) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };

        let mut filenames: Vec<String> = entries
            .flatten()
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|name| name.ends_with(".bin"))
            .collect();
        filenames.sort();

        let mut result = Vec::new();
        for filename in filenames {
            match fs::read(inbox.join(&filename)) {
                Ok(data) => result.push(InboxEntry { filename, data }),
                Err(err) => error!("failed to read inbox blob {}: {}", filename, err),
            }
        }
        result
    }

    fn accept_message(&self, sender: &str, body: &str) -> Option<Message> {
        let now = utcnow_str();
        let threadbox = self.threadbox_path(LOCAL_USER, sender);

        let mut message = Message {
            local_user: Some(LOCAL_USER.to_string()),
            sender: Some(sender.to_string()),
            timestamp: Some(now.clone()),
            received_at: Some(now.clone()),
            body: Some(body.to_string()),
            ..Default::default()
        };

        let json = match serde_json::to_vec(&message) {
            Ok(json) => json,
            Err(err) => {
                error!("cannot encode message from {}: {}", sender, err);
                return None;
            }
        };

        let filename = unique_filename(&now, "json", &[&threadbox]);
        match write_atomic(&threadbox.join(&filename), &json) {
            Ok(()) => {
                message.filename = filename;
                Some(message)
            }
            Err(err) => {
                error!("failed to file message from {}: {}", sender, err);
                None
            }
        }
    }

    fn remove_from_inbox(&self, filename: &str) {
        let path = self.inbox_path().join(filename);
        if let Err(err) = fs::remove_file(&path) {
            error!("failed to remove {}: {}", path.display(), err);
        }
    }

    fn outbox_path(&self) -> PathBuf {
        self.root.join(OUTBOX)
    }

    fn inbox_path(&self) -> PathBuf {
        self.root.join(INBOX)
    }

    fn threadboxes_path(&self, local_user: &str) -> PathBuf {
        self.root.join(local_user).join(THREAD)
    }

    fn threadbox_path(&self, local_user: &str, peer: &str) -> PathBuf {
        self.threadboxes_path(local_user).join(peer)
    }
}

/// `<sender>:<body>`, split on the first colon.
fn parse_inbound(data: &[u8]) -> Result<(String, String), Error> {
    let text = std::str::from_utf8(data)
        .map_err(|_| Error::ParseError("payload is not UTF-8".to_string()))?;
    let (sender, body) = text
        .split_once(':')
        .ok_or_else(|| Error::ParseError("payload has no sender separator".to_string()))?;
    if sender.is_empty() {
        return Err(Error::ParseError("payload has an empty sender".to_string()));
    }
    Ok((sender.to_string(), body.to_string()))
}

/// All parseable messages in `path`, keyed (and therefore sorted) by
/// filename. Unreadable files are logged and skipped.
fn read_mailbox(path: &Path) -> BTreeMap<String, Message> {
    let entries = match fs::read_dir(path) {
        Ok(entries) => entries,
        Err(_) => return BTreeMap::new(),
    };

    let mut result = BTreeMap::new();
    for entry in entries.flatten() {
        let filename = match entry.file_name().into_string() {
            Ok(name) => name,
            Err(_) => continue,
        };
        if !filename.ends_with(".json") {
            continue;
        }
        let file_path = path.join(&filename);
        match fs::read(&file_path).map_err(|e| e.to_string()).and_then(|data| {
            serde_json::from_slice::<Message>(&data).map_err(|e| e.to_string())
        }) {
            Ok(mut msg) => {
                msg.filename = filename.clone();
                result.insert(filename, msg);
            }
            Err(err) => error!("failed to read {}: {}", file_path.display(), err),
        }
    }
    result
}

/// Current UTC time, ISO-8601 with a `T` separator and no timezone suffix.
/// Microsecond precision keeps concurrent writers off each other's names.
fn utcnow_str() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
}

/// Timestamp-derived filename, with a numeric suffix when the plain name
/// is already taken in any of `dirs`.
fn unique_filename(timestamp: &str, ext: &str, dirs: &[&Path]) -> String {
    let base = timestamp.replace(':', ".");
    let taken = |name: &str| dirs.iter().any(|d| d.join(name).exists());

    let plain = format!("{}.{}", base, ext);
    if !taken(&plain) {
        return plain;
    }
    let mut n = 1;
    loop {
        let candidate = format!("{}-{}.{}", base, n, ext);
        if !taken(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

/// Write `data` to `path` via a `.tmp` twin: write, fsync, rename.
/// Parent directories are created lazily.
fn write_atomic(path: &Path, data: &[u8]) -> Result<(), Error> {
    let fs_err = |source: std::io::Error| Error::FilesystemIo {
        path: path.display().to_string(),
        source,
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(fs_err)?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut file = File::create(&tmp).map_err(fs_err)?;
    file.write_all(data).map_err(fs_err)?;
    file.sync_all().map_err(fs_err)?;
    drop(file);
    fs::rename(&tmp, path).map_err(fs_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, Mailboxes) {
        let dir = TempDir::new().unwrap();
        let boxes = Mailboxes::new(dir.path());
        (dir, boxes)
    }

    fn dir_filenames(path: &Path) -> Vec<String> {
        let mut names: Vec<String> = match fs::read_dir(path) {
            Ok(entries) => entries
                .flatten()
                .filter_map(|e| e.file_name().into_string().ok())
                .collect(),
            Err(_) => Vec::new(),
        };
        names.sort();
        names
    }

    #[test]
    fn queued_message_has_identical_twin_in_thread() {
        let (_dir, boxes) = store();
        boxes.queue_message_send("local", "415-800-8000", "Hi");

        let outbox = boxes.read_outbox();
        assert_eq!(outbox.len(), 1);
        let msg = &outbox[0];
        assert_eq!(msg.recipient.as_deref(), Some("+14158008000"));
        assert_eq!(msg.body.as_deref(), Some("Hi"));

        let outbox_file = boxes.outbox_path().join(&msg.filename);
        let thread_file = boxes
            .threadbox_path("local", "+14158008000")
            .join(&msg.filename);
        assert_eq!(
            fs::read(outbox_file).unwrap(),
            fs::read(thread_file).unwrap()
        );
    }

    #[test]
    fn unparseable_recipient_is_dropped() {
        let (_dir, boxes) = store();
        boxes.queue_message_send("local", "not a number", "Hi");

        assert!(boxes.read_outbox().is_empty());
        assert!(boxes.list_recipients("local").is_empty());
    }

    #[test]
    fn thread_marks_unsent_until_outbox_clears() {
        let (_dir, boxes) = store();
        boxes.queue_message_send("local", "+14158008000", "first");
        boxes.queue_message_send("local", "+14158008000", "second");

        let thread = boxes.get_thread("local", "+14158008000");
        assert_eq!(thread.len(), 2);
        assert!(thread.iter().all(|m| m.not_yet_sent));

        let sent = thread[0].filename.clone();
        boxes.remove_from_outbox(&sent);

        let thread = boxes.get_thread("local", "+14158008000");
        assert_eq!(thread.len(), 2, "thread copy must survive the send");
        assert!(!thread[0].not_yet_sent);
        assert!(thread[1].not_yet_sent);
        assert_eq!(boxes.read_outbox().len(), 1);
    }

    #[test]
    fn outbox_is_sorted_chronologically() {
        let (_dir, boxes) = store();
        boxes.queue_message_send_at("local", "+14158008000", "b", "2018-01-02T03:04:06.000000");
        boxes.queue_message_send_at("local", "+14158008000", "a", "2018-01-02T03:04:05.000000");

        let outbox = boxes.read_outbox();
        let bodies: Vec<_> = outbox.iter().map(|m| m.body.as_deref().unwrap()).collect();
        assert_eq!(bodies, ["a", "b"]);
    }

    #[test]
    fn same_timestamp_gets_a_disambiguator() {
        let (_dir, boxes) = store();
        let ts = "2018-01-02T03:04:05.123456";
        boxes.queue_message_send_at("local", "+14158008000", "one", ts);
        boxes.queue_message_send_at("local", "+14158008000", "two", ts);

        let outbox = boxes.read_outbox();
        assert_eq!(outbox.len(), 2);
        assert_ne!(outbox[0].filename, outbox[1].filename);
        assert_eq!(boxes.get_thread("local", "+14158008000").len(), 2);
    }

    #[test]
    fn accept_inbox_messages_files_into_sender_thread() {
        let (_dir, boxes) = store();
        boxes.save_message_to_inbox(b"alice:hi");
        assert_eq!(boxes.read_inbox().len(), 1);

        let accepted = boxes.accept_all_inbox_messages();
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].sender.as_deref(), Some("alice"));
        assert_eq!(accepted[0].body.as_deref(), Some("hi"));
        assert!(accepted[0].received_at.is_some());

        assert!(boxes.read_inbox().is_empty(), "parsed blobs are deleted");
        let thread = boxes.get_thread(LOCAL_USER, "alice");
        assert_eq!(thread.len(), 1);
        assert_eq!(thread[0].body.as_deref(), Some("hi"));
    }

    #[test]
    fn malformed_inbox_blob_stays_put() {
        let (_dir, boxes) = store();
        boxes.save_message_to_inbox(b"no separator here");
        boxes.save_message_to_inbox(b":empty sender");

        let accepted = boxes.accept_all_inbox_messages();
        assert!(accepted.is_empty());
        assert_eq!(boxes.read_inbox().len(), 2, "bad blobs are kept for inspection");
    }

    #[test]
    fn body_may_contain_separators() {
        let (_dir, boxes) = store();
        boxes.save_message_to_inbox(b"bob:see you at 12:30");

        let accepted = boxes.accept_all_inbox_messages();
        assert_eq!(accepted[0].sender.as_deref(), Some("bob"));
        assert_eq!(accepted[0].body.as_deref(), Some("see you at 12:30"));
    }

    #[test]
    fn delete_thread_removes_recipient() {
        let (_dir, boxes) = store();
        boxes.queue_message_send("local", "+14158008000", "Hi");
        assert_eq!(boxes.list_recipients("local"), ["+14158008000"]);

        boxes.delete_thread("local", "+14158008000");
        assert!(boxes.list_recipients("local").is_empty());
        assert!(boxes.get_thread("local", "+14158008000").is_empty());
    }

    #[test]
    fn atomic_writes_leave_no_temp_files() {
        let (_dir, boxes) = store();
        boxes.queue_message_send("local", "+14158008000", "Hi");
        boxes.save_message_to_inbox(b"alice:hi");

        for dir in [
            boxes.outbox_path(),
            boxes.inbox_path(),
            boxes.threadbox_path("local", "+14158008000"),
        ] {
            for name in dir_filenames(&dir) {
                assert!(!name.ends_with(".tmp"), "stray temp file {}", name);
            }
        }
    }

    #[test]
    fn missing_directories_read_as_empty() {
        let (_dir, boxes) = store();
        assert!(boxes.read_outbox().is_empty());
        assert!(boxes.read_inbox().is_empty());
        assert!(boxes.list_recipients("local").is_empty());
        assert!(boxes.get_thread("local", "nobody").is_empty());
    }
}
