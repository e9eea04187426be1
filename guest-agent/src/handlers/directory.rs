use std::os::unix::fs::MetadataExt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use guestlink_protocol::{
    DirEntry, DirectoryListRequest, DirectoryListingResponse, ErrorCode, ErrorResponse, Payload,
};

use super::file::{kind_of, modified_secs};
use super::{format_permissions, io_error, HandlerContext, HandlerResult};

/// One page of a directory listing, sorted by name.
///
/// The continuation token is the base64url encoding of the last name on
/// the previous page; the next page starts strictly after it. Entries added
/// or removed between pages may therefore be skipped or shown, never
/// duplicated.
pub async fn list(ctx: &HandlerContext, req: DirectoryListRequest) -> HandlerResult {
    let page_size = req.max_entries.clamp(1, ctx.config.files.max_dir_entries) as usize;
    let after = req
        .continuation_token
        .as_deref()
        .map(decode_token)
        .transpose()?;

    let meta = tokio::fs::metadata(&req.path)
        .await
        .map_err(|e| dir_error(&e, &req.path))?;
    if !meta.is_dir() {
        return Err(
            ErrorResponse::new(ErrorCode::NotADirectory, "path is not a directory")
                .with_context(req.path),
        );
    }

    let mut dir = tokio::fs::read_dir(&req.path)
        .await
        .map_err(|e| dir_error(&e, &req.path))?;

    let mut names = Vec::new();
    while let Some(entry) = dir
        .next_entry()
        .await
        .map_err(|e| io_error(&e, &req.path, ErrorCode::FileIoError))?
    {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !req.include_hidden && name.starts_with('.') {
            continue;
        }
        if after.as_deref().is_some_and(|a| name.as_str() <= a) {
            continue;
        }
        names.push((name, entry));
    }
    let (names, continuation_token) = paginate(names, page_size);

    let mut entries = Vec::with_capacity(names.len());
    for (name, entry) in names {
        // Entries can vanish between readdir and stat.
        let Ok(meta) = entry.metadata().await else {
            continue;
        };
        entries.push(DirEntry {
            kind: kind_of(&meta.file_type()),
            size: meta.len(),
            permissions: format_permissions(meta.mode()),
            modified: modified_secs(&meta),
            name,
        });
    }

    Ok(Payload::DirectoryListing(DirectoryListingResponse {
        path: req.path,
        entries,
        continuation_token,
    }))
}

/// Sort, cut to one page and derive the token from the last name kept.
/// The token does not depend on which of those entries can still be
/// stat'ed, so a page whose entries all vanish still continues.
fn paginate<T>(mut names: Vec<(String, T)>, page_size: usize) -> (Vec<(String, T)>, Option<String>) {
    names.sort_by(|a, b| a.0.cmp(&b.0));
    let more = names.len() > page_size;
    names.truncate(page_size);
    let token = if more {
        names.last().map(|(name, _)| URL_SAFE_NO_PAD.encode(name.as_bytes()))
    } else {
        None
    };
    (names, token)
}

fn decode_token(token: &str) -> Result<String, ErrorResponse> {
    URL_SAFE_NO_PAD
        .decode(token.as_bytes())
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .ok_or_else(|| ErrorResponse::new(ErrorCode::InvalidMessage, "invalid continuation token"))
}

fn dir_error(err: &std::io::Error, path: &str) -> ErrorResponse {
    if err.kind() == std::io::ErrorKind::NotFound {
        ErrorResponse::new(ErrorCode::DirectoryNotFound, err.to_string()).with_context(path)
    } else {
        io_error(err, path, ErrorCode::FileIoError)
    }
}
