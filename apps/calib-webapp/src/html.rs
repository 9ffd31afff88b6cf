use chessboard_vision::passes::PassInfo;

const STYLE: &str = r#"
body { font-family: -apple-system, BlinkMacSystemFont, "Segoe UI", Roboto, sans-serif; margin: 0; padding: 20px; background: #f5f5f5; }
.container { max-width: 1200px; margin: 0 auto; }
.pass { background: white; border: 1px solid #ddd; border-radius: 8px; margin: 15px 0; }
.pass.complete { border-left: 4px solid #4CAF50; }
.pass.incomplete { border-left: 4px solid #FFC107; }
.pass-header { padding: 15px 20px; background: #f9f9f9; cursor: pointer; display: flex; justify-content: space-between; }
.timestamp { font-size: 0.85em; color: #666; }
.pass-name { font-weight: 600; }
.badge { padding: 4px 12px; border-radius: 12px; font-size: 0.85em; margin-left: 10px; }
.badge.complete { background: #4CAF50; color: white; }
.badge.incomplete { background: #FFC107; color: #333; }
.pass-content { display: none; padding: 15px 20px; border-top: 1px solid #eee; }
.pass-content.expanded { display: block; }
.file-list { list-style: none; padding: 0; margin: 0; }
.file-item { padding: 10px; margin: 5px 0; background: #f9f9f9; border-radius: 4px; display: flex; justify-content: space-between; }
.file-meta { color: #666; font-size: 0.9em; }
.info-box { background: #E3F2FD; border-left: 4px solid #2196F3; padding: 15px; margin: 20px 0; }
.empty-state { text-align: center; padding: 40px; color: #999; background: white; border-radius: 8px; }
"#;

const SCRIPT: &str = r#"
function togglePass(header) { header.nextElementSibling.classList.toggle('expanded'); }
function setAll(expanded) {
  document.querySelectorAll('.pass-content').forEach(c => c.classList.toggle('expanded', expanded));
}
window.addEventListener('DOMContentLoaded', () => {
  const first = document.querySelector('.pass-header');
  if (first) { togglePass(first); }
});
"#;

pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

fn render_pass(out: &mut String, pass: &PassInfo) {
    let state = if pass.complete { "complete" } else { "incomplete" };
    let label = if pass.complete { "Complete" } else { "In Progress" };
    let id = escape(&pass.pass_id);
    let visible: Vec<_> = pass.files.iter().filter(|f| !f.name.starts_with('.')).collect();

    out.push_str(&format!(
        r#"<div class="pass {state}"><div class="pass-header" onclick="togglePass(this)"><div><div class="timestamp">{}</div><span class="pass-name">{id}</span><span class="badge {state}">{label}</span></div><span class="file-meta">({} files)</span></div><div class="pass-content"><ul class="file-list">"#,
        escape(&pass.timestamp),
        pass.files.len(),
    ));
    for file in visible {
        let name = escape(&file.name);
        out.push_str(&format!(
            r#"<li class="file-item"><a href="/download/{id}/{name}" target="_blank">{name}</a><span class="file-meta">{} bytes | {}</span></li>"#,
            file.size,
            escape(&file.modified),
        ));
    }
    out.push_str("</ul></div></div>");
}

/// Pass browser page. `passes` is expected newest first.
pub fn index_page(passes: &[PassInfo], watcher_enabled: bool) -> String {
    let mut out = String::new();
    out.push_str("<!DOCTYPE html><html><head><title>Calibration Data</title><style>");
    out.push_str(STYLE);
    out.push_str("</style></head><body><div class=\"container\"><h1>Calibration Data Viewer</h1>");
    if watcher_enabled {
        out.push_str(
            "<div class=\"info-box\"><strong>Auto-monitoring enabled</strong><br>Watching for completed passes (marked with .complete file)</div>",
        );
    }
    out.push_str("<h2>Calibration Passes</h2><button onclick=\"location.reload()\">Refresh</button><button onclick=\"setAll(true)\">Expand All</button><button onclick=\"setAll(false)\">Collapse All</button><div id=\"passes\">");
    if passes.is_empty() {
        out.push_str("<div class=\"empty-state\"><p>No calibration passes yet.</p></div>");
    }
    for pass in passes {
        render_pass(&mut out, pass);
    }
    out.push_str("</div></div><script>");
    out.push_str(SCRIPT);
    out.push_str("</script></body></html>");
    out
}
