//! Embedded console bundle
//!
//! The bridge serves everything from memory: the console page, a minimal
//! VNC client stub and the diagnostic page. Swap the stub for the full
//! noVNC bundle (https://github.com/novnc/noVNC) to get a complete client.

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};

/// Static file handler for the embedded bundle
pub struct StaticFiles;

impl StaticFiles {
    /// Serve a bundle file under `/app/`.
    pub fn serve(path: &str) -> Response {
        let content_type = guess_content_type(path);
        match path {
            "rfb.js" => serve_embedded(RFB_JS, content_type),
            "style.css" => serve_embedded(STYLE_CSS, content_type),
            _ => (StatusCode::NOT_FOUND, "File not found").into_response(),
        }
    }

    /// Console page with the session title substituted in.
    pub fn console_page(title: &str) -> String {
        CONSOLE_HTML.replace("{{title}}", title)
    }

    /// Diagnostic page shown when the upstream websocket cannot be opened.
    pub fn diagnostic_page(detail: &str) -> String {
        DIAGNOSTIC_HTML.replace("{{detail}}", detail)
    }
}

fn guess_content_type(path: &str) -> &'static str {
    if path.ends_with(".js") {
        "application/javascript"
    } else if path.ends_with(".css") {
        "text/css"
    } else if path.ends_with(".html") {
        "text/html"
    } else {
        "application/octet-stream"
    }
}

fn serve_embedded(content: &'static str, content_type: &'static str) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, content_type)],
        content,
    )
        .into_response()
}

const CONSOLE_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
    <title>{{title}} - pvedash console</title>
    <link rel="stylesheet" href="/app/style.css">
</head>
<body>
    <div id="status">Connecting...</div>
    <div id="screen"></div>
    <script type="module">
        import RFB from '/app/rfb.js';

        const params = new URLSearchParams(window.location.search);
        const password = params.get('password') || '';
        const scheme = window.location.protocol === 'https:' ? 'wss' : 'ws';
        const wsUrl = `${scheme}://${window.location.host}/ws`;

        const status = document.getElementById('status');
        const rfb = new RFB(document.getElementById('screen'), wsUrl, {
            credentials: { password },
        });
        rfb.addEventListener('connect', () => {
            status.textContent = 'Connected to {{title}}';
        });
        rfb.addEventListener('disconnect', (e) => {
            status.textContent = e.detail.clean
                ? 'Disconnected'
                : 'Connection lost';
        });
    </script>
</body>
</html>
"#;

const DIAGNOSTIC_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
    <title>pvedash console - connection failed</title>
    <link rel="stylesheet" href="/app/style.css">
</head>
<body>
    <div id="status" class="error">Could not reach the VNC endpoint</div>
    <pre>{{detail}}</pre>
    <p>The one-time ticket may have expired. Close this tab and reopen the
    console from the dashboard.</p>
</body>
</html>
"#;

const STYLE_CSS: &str = r#"
body { margin: 0; background: #1b1b1b; color: #d8d8d8; font-family: monospace; }
#status { padding: 6px 10px; background: #2a2a2a; }
#status.error { background: #5c1f1f; }
#screen { width: 100vw; height: calc(100vh - 30px); }
pre { padding: 10px; white-space: pre-wrap; }
"#;

// Minimal embedded client stub - use the full noVNC bundle for production.
const RFB_JS: &str = r#"
export default class RFB extends EventTarget {
    constructor(target, url, options = {}) {
        super();
        this.target = target;
        this.url = url;
        this.options = options;
        this._ws = new WebSocket(url, 'binary');
        this._ws.binaryType = 'arraybuffer';
        this._ws.onopen = () => {
            this.dispatchEvent(new CustomEvent('connect'));
            console.log('RFB: websocket open; use the full noVNC library for rendering');
        };
        this._ws.onclose = (e) => {
            this.dispatchEvent(new CustomEvent('disconnect', {
                detail: { clean: e.wasClean },
            }));
        };
    }

    disconnect() {
        this._ws.close();
    }

    sendCredentials(credentials) {
        console.log('RFB: sendCredentials');
    }

    sendCtrlAltDel() {
        console.log('RFB: sendCtrlAltDel');
    }
}
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn console_page_substitutes_title() {
        let page = StaticFiles::console_page("web-vm (100)");
        assert!(page.contains("web-vm (100)"));
        assert!(!page.contains("{{title}}"));
    }

    #[test]
    fn unknown_bundle_paths_are_404() {
        let res = StaticFiles::serve("core/missing.js");
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }
}
