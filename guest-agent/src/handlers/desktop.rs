//! Display resolution and clipboard for guests running a graphical session.

use std::path::Path;

use guestlink_protocol::{
    ClipboardContent, ClipboardSetRequest, DisplayResizeRequest, ErrorCode, ErrorResponse, Payload,
};
use tracing::info;

use super::platform::DisplayServer;
use super::{HandlerContext, HandlerResult};

pub const MIN_WIDTH: u32 = 320;
pub const MIN_HEIGHT: u32 = 200;
pub const MAX_DIMENSION: u32 = 8192;

/// Where X11 server sockets live.
pub const X11_SOCKET_DIR: &str = "/tmp/.X11-unix";

pub async fn resize(ctx: &HandlerContext, req: DisplayResizeRequest) -> HandlerResult {
    if !(MIN_WIDTH..=MAX_DIMENSION).contains(&req.width)
        || !(MIN_HEIGHT..=MAX_DIMENSION).contains(&req.height)
    {
        return Err(ErrorResponse::new(
            ErrorCode::ResolutionNotSupported,
            format!(
                "{}x{} outside {MIN_WIDTH}x{MIN_HEIGHT}..{MAX_DIMENSION}x{MAX_DIMENSION}",
                req.width, req.height
            ),
        ));
    }
    let server = display(ctx)?;
    ctx.platform
        .resize_display(&server, req.width, req.height, req.output.as_deref())
        .await?;
    info!(width = req.width, height = req.height, "display resized");
    Ok(Payload::Ok)
}

pub async fn clipboard_get(ctx: &HandlerContext) -> HandlerResult {
    let server = display(ctx)?;
    let content = ctx.platform.clipboard_get(&server).await?;
    if content.is_empty() {
        return Err(ErrorResponse::new(ErrorCode::ClipboardEmpty, "clipboard is empty"));
    }
    Ok(Payload::Clipboard(ClipboardContent {
        content,
        mime_type: "text/plain".to_string(),
    }))
}

pub async fn clipboard_set(ctx: &HandlerContext, req: ClipboardSetRequest) -> HandlerResult {
    if !req.mime_type.starts_with("text/") {
        return Err(ErrorResponse::new(
            ErrorCode::ClipboardTypeUnsupported,
            format!("only text clipboard content is supported, got {}", req.mime_type),
        ));
    }
    let server = display(ctx)?;
    ctx.platform
        .clipboard_set(&server, &req.content, &req.mime_type)
        .await?;
    Ok(Payload::Ok)
}

fn display(ctx: &HandlerContext) -> Result<DisplayServer, ErrorResponse> {
    ctx.platform.display_server().ok_or_else(|| {
        ErrorResponse::new(ErrorCode::NoDisplayServer, "no X11 or Wayland session found")
    })
}

/// Find a graphical session from the environment, falling back to X11
/// sockets on disk. Wayland wins when both are present.
pub fn detect_display_server(
    env: impl Fn(&str) -> Option<String>,
    x11_dir: &Path,
) -> Option<DisplayServer> {
    let set = |key: &str| env(key).filter(|v| !v.is_empty());
    if let Some(socket) = set("WAYLAND_DISPLAY") {
        return Some(DisplayServer::Wayland { socket });
    }
    if let Some(display) = set("DISPLAY") {
        return Some(DisplayServer::X11 { display });
    }

    let entries = std::fs::read_dir(x11_dir).ok()?;
    entries
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            e.file_name()
                .to_str()
                .and_then(|n| n.strip_prefix('X'))
                .and_then(|n| n.parse::<u32>().ok())
        })
        .min()
        .map(|n| DisplayServer::X11 {
            display: format!(":{n}"),
        })
}

/// The output to resize from `xrandr --query`: the connected primary output,
/// or else the first connected one.
pub fn parse_xrandr_primary(query: &str) -> Option<String> {
    let connected: Vec<&str> = query
        .lines()
        .filter(|l| l.contains(" connected"))
        .collect();
    connected
        .iter()
        .find(|l| l.contains(" connected primary"))
        .or_else(|| connected.first())
        .and_then(|l| l.split_whitespace().next())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::handlers::platform::fake::RecordingPlatform;
    use crate::handlers::test_support::{context, context_with};

    fn with_display() -> (HandlerContext, std::sync::Arc<RecordingPlatform>) {
        context_with(
            AgentConfig::default(),
            RecordingPlatform {
                display: Some(DisplayServer::X11 {
                    display: ":0".into(),
                }),
                ..Default::default()
            },
        )
    }

    fn resize_req(width: u32, height: u32) -> DisplayResizeRequest {
        DisplayResizeRequest {
            width,
            height,
            output: None,
        }
    }

    #[tokio::test]
    async fn test_resize_bounds() {
        let (ctx, platform) = with_display();
        assert!(resize(&ctx, resize_req(1920, 1080)).await.is_ok());
        assert!(resize(&ctx, resize_req(320, 200)).await.is_ok());
        for (w, h) in [(319, 600), (800, 199), (8193, 600), (0, 0)] {
            let err = resize(&ctx, resize_req(w, h)).await.unwrap_err();
            assert!(err.is(ErrorCode::ResolutionNotSupported), "{w}x{h}");
        }
        assert_eq!(platform.calls(), vec!["resize 1920x1080", "resize 320x200"]);
    }

    #[tokio::test]
    async fn test_no_display_server() {
        let (ctx, _) = context();
        let err = resize(&ctx, resize_req(1024, 768)).await.unwrap_err();
        assert!(err.is(ErrorCode::NoDisplayServer));
        let err = clipboard_get(&ctx).await.unwrap_err();
        assert!(err.is(ErrorCode::NoDisplayServer));
    }

    #[tokio::test]
    async fn test_clipboard_roundtrip() {
        let (ctx, _) = with_display();
        let err = clipboard_get(&ctx).await.unwrap_err();
        assert!(err.is(ErrorCode::ClipboardEmpty));

        clipboard_set(
            &ctx,
            ClipboardSetRequest {
                content: "hello".into(),
                mime_type: "text/plain".into(),
            },
        )
        .await
        .unwrap();
        match clipboard_get(&ctx).await.unwrap() {
            Payload::Clipboard(c) => assert_eq!(c.content, "hello"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_clipboard_rejects_binary() {
        let (ctx, _) = with_display();
        let err = clipboard_set(
            &ctx,
            ClipboardSetRequest {
                content: "x".into(),
                mime_type: "image/png".into(),
            },
        )
        .await
        .unwrap_err();
        assert!(err.is(ErrorCode::ClipboardTypeUnsupported));
    }

    #[test]
    fn test_detection_order() {
        let empty = tempfile::tempdir().unwrap();
        let both = |k: &str| match k {
            "WAYLAND_DISPLAY" => Some("wayland-0".to_string()),
            "DISPLAY" => Some(":1".to_string()),
            _ => None,
        };
        assert_eq!(
            detect_display_server(both, empty.path()),
            Some(DisplayServer::Wayland {
                socket: "wayland-0".into()
            })
        );

        let x_only = |k: &str| (k == "DISPLAY").then(|| ":1".to_string());
        assert_eq!(
            detect_display_server(x_only, empty.path()),
            Some(DisplayServer::X11 {
                display: ":1".into()
            })
        );

        assert_eq!(detect_display_server(|_| None, empty.path()), None);
        assert_eq!(
            detect_display_server(|_| Some(String::new()), Path::new("/nonexistent")),
            None
        );
    }

    #[test]
    fn test_detection_from_sockets() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("X2"), b"").unwrap();
        std::fs::write(dir.path().join("X0"), b"").unwrap();
        std::fs::write(dir.path().join("junk"), b"").unwrap();
        assert_eq!(
            detect_display_server(|_| None, dir.path()),
            Some(DisplayServer::X11 {
                display: ":0".into()
            })
        );
    }

    #[test]
    fn test_xrandr_output_selection() {
        let query = "\
Screen 0: minimum 320 x 200, current 1024 x 768, maximum 8192 x 8192
Virtual-1 connected 1024x768+0+0 (normal left inverted right x axis y axis) 0mm x 0mm
   1024x768      60.00*+
Virtual-2 connected primary 800x600+0+0 0mm x 0mm
Virtual-3 disconnected (normal left inverted right x axis y axis)
";
        assert_eq!(parse_xrandr_primary(query).as_deref(), Some("Virtual-2"));

        let no_primary = "Virtual-3 disconnected\nVirtual-1 connected 1024x768+0+0\n";
        assert_eq!(parse_xrandr_primary(no_primary).as_deref(), Some("Virtual-1"));
        assert_eq!(parse_xrandr_primary("Virtual-3 disconnected\n"), None);
    }
}
