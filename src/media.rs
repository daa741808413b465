//! Mapping message payloads to downloadable media descriptors.
//!
//! Only photos and documents are downloadable; polls, geo, contacts and
//! webpage previews are ignored.

use chrono::{DateTime, Utc};
use grammers_tl_types as tl;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Photo,
    Document,
}

/// Everything needed to issue byte-range reads for one media object.
#[derive(Debug, Clone)]
pub struct MediaDescriptor {
    pub kind: MediaKind,
    pub file_id: i64,
    pub access_hash: i64,
    pub file_reference: Vec<u8>,
    /// Type code of the chosen photo size; empty for documents.
    pub thumb_size: String,
    pub declared_size: i64,
    pub mime_type: String,
    pub file_name: String,
    pub message_id: i32,
    pub peer_id: i64,
    pub message_date: DateTime<Utc>,
}

impl MediaDescriptor {
    pub fn input_location(&self) -> tl::enums::InputFileLocation {
        match self.kind {
            MediaKind::Photo => tl::enums::InputFileLocation::InputPhotoFileLocation(
                tl::types::InputPhotoFileLocation {
                    id: self.file_id,
                    access_hash: self.access_hash,
                    file_reference: self.file_reference.clone(),
                    thumb_size: self.thumb_size.clone(),
                },
            ),
            MediaKind::Document => tl::enums::InputFileLocation::InputDocumentFileLocation(
                tl::types::InputDocumentFileLocation {
                    id: self.file_id,
                    access_hash: self.access_hash,
                    file_reference: self.file_reference.clone(),
                    thumb_size: String::new(),
                },
            ),
        }
    }
}

/// Extract a descriptor from a raw message, if it carries downloadable
/// media. Service messages and empty messages yield nothing.
pub fn extract_from_raw(message: &tl::enums::Message, peer_id: i64) -> Option<MediaDescriptor> {
    match message {
        tl::enums::Message::Message(m) => extract(m, peer_id),
        _ => None,
    }
}

pub fn extract(message: &tl::types::Message, peer_id: i64) -> Option<MediaDescriptor> {
    let date = message_date(message.date);
    match message.media.as_ref()? {
        tl::enums::MessageMedia::Photo(media) => {
            let tl::enums::Photo::Photo(photo) = media.photo.as_ref()? else {
                return None;
            };
            Some(photo_descriptor(photo, message.id, peer_id, date))
        }
        tl::enums::MessageMedia::Document(media) => {
            let tl::enums::Document::Document(doc) = media.document.as_ref()? else {
                return None;
            };
            Some(document_descriptor(doc, message.id, peer_id, date))
        }
        _ => None,
    }
}

pub fn photo_descriptor(
    photo: &tl::types::Photo,
    message_id: i32,
    peer_id: i64,
    message_date: DateTime<Utc>,
) -> MediaDescriptor {
    let (size, thumb_size) = largest_photo_size(&photo.sizes);
    MediaDescriptor {
        kind: MediaKind::Photo,
        file_id: photo.id,
        access_hash: photo.access_hash,
        file_reference: photo.file_reference.clone(),
        thumb_size,
        declared_size: i64::from(size),
        mime_type: "image/jpeg".to_string(),
        file_name: format!("photo_{}.jpg", photo.id),
        message_id,
        peer_id,
        message_date,
    }
}

pub fn document_descriptor(
    doc: &tl::types::Document,
    message_id: i32,
    peer_id: i64,
    message_date: DateTime<Utc>,
) -> MediaDescriptor {
    let file_name = doc
        .attributes
        .iter()
        .find_map(|attr| match attr {
            tl::enums::DocumentAttribute::Filename(f) => Some(f.file_name.clone()),
            _ => None,
        })
        .unwrap_or_else(|| format!("document_{}", doc.id));

    MediaDescriptor {
        kind: MediaKind::Document,
        file_id: doc.id,
        access_hash: doc.access_hash,
        file_reference: doc.file_reference.clone(),
        thumb_size: String::new(),
        declared_size: doc.size,
        mime_type: doc.mime_type.clone(),
        file_name,
        message_id,
        peer_id,
        message_date,
    }
}

/// Pick the largest stored size and its type code. Progressive sizes
/// report their full-quality (last) ladder entry; stripped inline
/// previews count their raw bytes.
pub fn largest_photo_size(sizes: &[tl::enums::PhotoSize]) -> (i32, String) {
    let mut best = (0, String::new());
    for size in sizes {
        let (bytes, ty) = match size {
            tl::enums::PhotoSize::Size(s) => (s.size, s.r#type.clone()),
            tl::enums::PhotoSize::PhotoStrippedSize(s) => (s.bytes.len() as i32, s.r#type.clone()),
            tl::enums::PhotoSize::Progressive(s) => {
                (s.sizes.last().copied().unwrap_or(0), s.r#type.clone())
            }
            _ => continue,
        };
        if bytes > best.0 {
            best = (bytes, ty);
        }
    }
    best
}

/// Message id regardless of variant (service and empty messages have
/// ids too, and pagination needs them).
pub fn message_id(message: &tl::enums::Message) -> Option<i32> {
    match message {
        tl::enums::Message::Message(m) => Some(m.id),
        tl::enums::Message::Service(m) => Some(m.id),
        tl::enums::Message::Empty(m) => Some(m.id),
    }
}

/// Bare id of the peer that owns a message.
pub fn peer_bare_id(peer: &tl::enums::Peer) -> i64 {
    match peer {
        tl::enums::Peer::User(p) => p.user_id,
        tl::enums::Peer::Chat(p) => p.chat_id,
        tl::enums::Peer::Channel(p) => p.channel_id,
    }
}

pub fn preview_from_raw(message: &tl::enums::Message) -> String {
    match message {
        tl::enums::Message::Message(m) => preview_text(m),
        tl::enums::Message::Service(_) => "[service]".to_string(),
        tl::enums::Message::Empty(_) => "[empty]".to_string(),
    }
}

/// Short human-readable summary of a message for logging.
pub fn preview_text(message: &tl::types::Message) -> String {
    if !message.message.is_empty() {
        return truncate_chars(&message.message, 50);
    }
    match &message.media {
        Some(tl::enums::MessageMedia::Photo(_)) => "[photo]".to_string(),
        Some(tl::enums::MessageMedia::Document(_)) => "[document]".to_string(),
        Some(_) => "[media]".to_string(),
        None => "[empty]".to_string(),
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    let text = text.replace('\n', " ");
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text,
    }
}

fn message_date(unix: i32) -> DateTime<Utc> {
    DateTime::from_timestamp(i64::from(unix), 0).unwrap_or_default()
}
