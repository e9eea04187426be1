use std::fs::{FileType, Metadata, Permissions};
use std::io::SeekFrom;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use guestlink_protocol::{
    DirectoryCreateRequest, ErrorCode, ErrorResponse, FileContentResponse, FileDeleteRequest,
    FileInfoResponse, FileKind, FileReadRequest, FileStatRequest, FileWriteRequest, Payload,
};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

use super::{format_permissions, io_error, HandlerContext, HandlerResult};

pub async fn read(ctx: &HandlerContext, req: FileReadRequest) -> HandlerResult {
    let max = ctx.config.files.max_chunk_size as u64;
    let len = req.length.unwrap_or(max).min(max);

    let meta = tokio::fs::metadata(&req.path)
        .await
        .map_err(|e| io_error(&e, &req.path, ErrorCode::FileIoError))?;
    if meta.is_dir() {
        return Err(ErrorResponse::new(ErrorCode::NotAFile, "path is a directory").with_context(req.path));
    }
    // Pseudo-files under /proc and /sys report a size of zero.
    let total = meta.len();
    if total > 0 && req.offset > total {
        return Err(ErrorResponse::new(
            ErrorCode::InvalidOffset,
            format!("offset {} is past end of file ({total} bytes)", req.offset),
        )
        .with_context(req.path));
    }

    let mut file = tokio::fs::File::open(&req.path)
        .await
        .map_err(|e| io_error(&e, &req.path, ErrorCode::FileIoError))?;
    if req.offset > 0 {
        file.seek(SeekFrom::Start(req.offset))
            .await
            .map_err(|e| io_error(&e, &req.path, ErrorCode::InvalidOffset))?;
    }
    let mut buf = Vec::with_capacity(len.min(total.saturating_sub(req.offset).max(4096)) as usize);
    let n = file
        .take(len)
        .read_to_end(&mut buf)
        .await
        .map_err(|e| io_error(&e, &req.path, ErrorCode::FileIoError))? as u64;

    let eof = n < len || (total > 0 && req.offset + n >= total);
    debug!(path = %req.path, offset = req.offset, bytes = n, eof, "file read");
    Ok(Payload::FileContent(FileContentResponse {
        data: B64.encode(&buf),
        offset: req.offset,
        size: n,
        total_size: total.max(req.offset + n),
        eof,
    }))
}

pub async fn write(ctx: &HandlerContext, req: FileWriteRequest) -> HandlerResult {
    let data = B64.decode(req.data.as_bytes()).map_err(|e| {
        ErrorResponse::new(ErrorCode::DecodingError, format!("invalid base64 data: {e}"))
    })?;
    if data.len() > ctx.config.files.max_chunk_size {
        return Err(ErrorResponse::new(
            ErrorCode::FileTooLarge,
            format!(
                "chunk of {} bytes exceeds limit of {}",
                data.len(),
                ctx.config.files.max_chunk_size
            ),
        ));
    }

    let path = Path::new(&req.path);
    if req.create_parents {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(&e, &req.path, ErrorCode::MkdirFailed))?;
        }
    }

    let mut opts = tokio::fs::OpenOptions::new();
    opts.write(true).create(true);
    if req.append {
        opts.append(true);
    } else if req.offset.is_none() {
        opts.truncate(true);
    }
    if let Some(mode) = req.mode {
        opts.mode(mode);
    }
    let mut file = opts
        .open(path)
        .await
        .map_err(|e| io_error(&e, &req.path, ErrorCode::FileIoError))?;

    if let (Some(offset), false) = (req.offset, req.append) {
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| io_error(&e, &req.path, ErrorCode::InvalidOffset))?;
    }
    file.write_all(&data)
        .await
        .map_err(|e| io_error(&e, &req.path, ErrorCode::FileIoError))?;
    file.flush()
        .await
        .map_err(|e| io_error(&e, &req.path, ErrorCode::FileIoError))?;

    // `mode` on open only applies to new files.
    if let Some(mode) = req.mode {
        tokio::fs::set_permissions(path, Permissions::from_mode(mode))
            .await
            .map_err(|e| io_error(&e, &req.path, ErrorCode::FileIoError))?;
    }

    debug!(path = %req.path, bytes = data.len(), append = req.append, "file written");
    stat_path(&req.path).await
}

pub async fn delete(_ctx: &HandlerContext, req: FileDeleteRequest) -> HandlerResult {
    if Path::new(&req.path) == Path::new("/") {
        return Err(ErrorResponse::new(ErrorCode::DeleteFailed, "refusing to delete /"));
    }
    let meta = tokio::fs::symlink_metadata(&req.path)
        .await
        .map_err(|e| io_error(&e, &req.path, ErrorCode::DeleteFailed))?;

    let result = if meta.is_dir() {
        if req.recursive {
            tokio::fs::remove_dir_all(&req.path).await
        } else {
            tokio::fs::remove_dir(&req.path).await
        }
    } else {
        tokio::fs::remove_file(&req.path).await
    };
    result.map_err(|e| io_error(&e, &req.path, ErrorCode::DeleteFailed))?;
    Ok(Payload::Ok)
}

pub async fn stat(_ctx: &HandlerContext, req: FileStatRequest) -> HandlerResult {
    stat_path(&req.path).await
}

pub async fn create_directory(_ctx: &HandlerContext, req: DirectoryCreateRequest) -> HandlerResult {
    let result = if req.parents {
        tokio::fs::create_dir_all(&req.path).await
    } else {
        tokio::fs::create_dir(&req.path).await
    };
    result.map_err(|e| io_error(&e, &req.path, ErrorCode::MkdirFailed))?;

    if let Some(mode) = req.mode {
        tokio::fs::set_permissions(&req.path, Permissions::from_mode(mode))
            .await
            .map_err(|e| io_error(&e, &req.path, ErrorCode::MkdirFailed))?;
    }
    stat_path(&req.path).await
}

async fn stat_path(path: &str) -> HandlerResult {
    match tokio::fs::symlink_metadata(path).await {
        Ok(meta) => Ok(Payload::FileInfo(file_info(path, &meta))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Ok(Payload::FileInfo(FileInfoResponse {
                path: path.to_string(),
                exists: false,
                kind: None,
                size: 0,
                mode: 0,
                permissions: String::new(),
                modified: None,
                uid: 0,
                gid: 0,
            }))
        }
        Err(e) => Err(io_error(&e, path, ErrorCode::FileIoError)),
    }
}

pub fn file_info(path: &str, meta: &Metadata) -> FileInfoResponse {
    FileInfoResponse {
        path: path.to_string(),
        exists: true,
        kind: Some(kind_of(&meta.file_type())),
        size: meta.len(),
        mode: meta.mode() & 0o7777,
        permissions: format_permissions(meta.mode()),
        modified: modified_secs(meta),
        uid: meta.uid(),
        gid: meta.gid(),
    }
}

pub fn kind_of(ft: &FileType) -> FileKind {
    if ft.is_symlink() {
        FileKind::Symlink
    } else if ft.is_dir() {
        FileKind::Directory
    } else if ft.is_file() {
        FileKind::File
    } else {
        FileKind::Other
    }
}

pub fn modified_secs(meta: &Metadata) -> Option<u64> {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
}
