//! Attachment metadata: filename sanitizing and comment pairing.
//!
//! Older bug rows pair attachments with comments purely by position:
//! attachment 0 belongs to the description and attachment `i + 1` to comment
//! `i`. New rows carry an explicit [`AttachmentOwner`]. Lookups prefer the
//! owner and fall back to position only for rows that have none.

use crate::models::{Attachment, AttachmentOwner, Comment};

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum AttachmentError {
    #[error("attachment '{0}' has no retrievable url")]
    MissingUrl(String),
}

/// Whitespace becomes `_`; anything other than ASCII alphanumerics, `.`, `_`
/// and `-` is dropped.
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect();
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned
    }
}

/// Legacy pairing: the attachment shown under comment `comment_index`.
pub fn positional_attachment(files: &[Attachment], comment_index: usize) -> Option<&Attachment> {
    files.get(comment_index + 1)
}

pub fn description_attachment(files: &[Attachment]) -> Option<&Attachment> {
    files
        .iter()
        .find(|a| a.owner == Some(AttachmentOwner::Description))
        .or_else(|| files.first().filter(|a| a.owner.is_none()))
}

/// The attachment rendered under the comment at `comment_index`.
pub fn attachment_for_comment<'a>(
    files: &'a [Attachment],
    comments: &[Comment],
    comment_index: usize,
) -> Option<&'a Attachment> {
    let explicit = comments
        .get(comment_index)
        .and_then(|c| c.id)
        .and_then(|id| {
            files
                .iter()
                .find(|a| matches!(a.owner, Some(AttachmentOwner::Comment { id: owner }) if owner == id))
        });
    explicit.or_else(|| positional_attachment(files, comment_index).filter(|a| a.owner.is_none()))
}

/// One-time migration from positional pairing to explicit owners.
///
/// Comments must already have ids. Attachments past the end of the thread
/// stay unowned. Returns how many attachments received an owner.
pub fn assign_positional_owners(comments: &[Comment], files: &mut [Attachment]) -> usize {
    let mut migrated = 0;
    for (pos, file) in files.iter_mut().enumerate() {
        if file.owner.is_some() {
            continue;
        }
        let owner = match pos {
            0 => Some(AttachmentOwner::Description),
            p => comments.get(p - 1).and_then(|c| c.id).map(|id| AttachmentOwner::Comment { id }),
        };
        if owner.is_some() {
            file.owner = owner;
            migrated += 1;
        }
    }
    migrated
}

/// The URL to render, falling back to `<storage_base>/<path>`.
pub fn resolve_url(file: &Attachment, storage_base: Option<&str>) -> Result<String, AttachmentError> {
    if let Some(url) = file.url.as_deref().filter(|u| !u.is_empty()) {
        return Ok(url.to_string());
    }
    match (storage_base, file.path.as_deref()) {
        (Some(base), Some(path)) if !path.is_empty() => {
            Ok(format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/')))
        }
        _ => Err(AttachmentError::MissingUrl(file.filename.clone())),
    }
}

/// Fill in missing URLs from `storage_base`; files that cannot be resolved
/// keep `url: None`.
pub fn fill_urls(files: &mut [Attachment], storage_base: &str) {
    for f in files.iter_mut().filter(|f| f.url.is_none()) {
        match resolve_url(f, Some(storage_base)) {
            Ok(url) => f.url = Some(url),
            Err(e) => tracing::warn!("{e}"),
        }
    }
}
