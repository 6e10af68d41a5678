//! Minimal HTML wrappers around the binary endpoints

pub const INDEX: &str = r#"<!doctype html>
<html>
<head><meta charset="utf-8"><title>PyCamLights</title></head>
<body>
  <h1>PyCamLights</h1>
  <ul>
    <li><a href="/stream?page=true">Live stream</a> (raw: <a href="/video">/video</a>)</li>
    <li><a href="/camera?res=low">Snapshot (low)</a></li>
    <li><a href="/camera?res=high">Snapshot (high)</a></li>
    <li><a href="/lights/on">Lights on</a> / <a href="/lights/off">off</a></li>
    <li><a href="/status">Status</a></li>
  </ul>
</body>
</html>
"#;

pub fn stream_page() -> String {
    page("Live stream", r#"<img src="/stream" alt="camera stream">"#)
}

pub fn still_page(data_url: &str) -> String {
    page("Snapshot", &format!(r#"<img src="{data_url}" alt="camera still">"#))
}

fn page(title: &str, body: &str) -> String {
    format!(
        "<!doctype html>\n<html>\n<head><meta charset=\"utf-8\"><title>{title}</title></head>\n\
         <body>\n  <h1>{title}</h1>\n  {body}\n  <p><a href=\"/\">Back</a></p>\n</body>\n</html>\n"
    )
}
