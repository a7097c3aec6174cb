// Minimal HTML for the update and log pages. Progress lines are streamed one at a time.

use ota_core::WatchOutcome;

const STYLE: &str = "body{background:#1a1a1a;color:#e5e7eb;font-family:monospace;padding:1rem}\
a{color:#60a5fa}h1{font-family:sans-serif;font-size:1.25rem}";

pub fn page_head(title: &str) -> String {
    format!(
        "<!DOCTYPE html><html><head><meta charset=\"utf-8\"><title>{0}</title>\
         <style>{1}</style></head><body><h1>{0}</h1>\
         <nav><a href=\"/ota\">Update</a> | <a href=\"/logs\">Logs</a></nav><hr>",
        html_escape(title),
        STYLE
    )
}

pub const PAGE_TAIL: &str = "</body></html>";

pub fn progress_line(line: &str) -> String {
    let mut out = html_escape(line);
    out.push_str("<br>");
    out
}

pub fn outcome_footer(outcome: WatchOutcome, bytes_written: u32) -> String {
    let message = match outcome {
        WatchOutcome::Completed => "Update written. The device is restarting.",
        WatchOutcome::Failed => "Update failed. The running firmware was kept unless a restart was reported above.",
        WatchOutcome::TimedOut => "Stopped waiting; the update continues in the background. See /logs.",
    };
    format!("<hr><p>{}</p><p>{} bytes written to flash.</p>{}", message, bytes_written, PAGE_TAIL)
}

pub fn render_logs_page(lines: &[String], running: bool, bytes_written: u32) -> String {
    let mut html = page_head("Recent update log");
    if running {
        html.push_str(&format!("<p>Update in progress: {} bytes written.</p>", bytes_written));
    }
    if lines.is_empty() {
        html.push_str("<p>No update has run since boot.</p>");
    }
    for line in lines {
        html.push_str(&progress_line(line));
    }
    html.push_str(PAGE_TAIL);
    html
}

pub fn html_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
