use crate::http::Response;

/// Last-resort document for navigations when neither the network nor the
/// cache can answer. Built in memory, so it cannot fail.
pub fn offline_document(app_name: &str) -> Response {
  let name = escape_html(app_name);
  let body = format!(
    r#"<!doctype html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>{name} (offline)</title>
<style>body{{font-family:system-ui,sans-serif;max-width:32rem;margin:4rem auto;padding:0 1rem;color:#333}}</style>
</head>
<body>
<h1>You are offline</h1>
<p>{name} could not reach the network and has no saved copy of this page yet.</p>
<p><a href="">Try again</a></p>
</body>
</html>
"#
  );

  Response::new(503)
    .with_header("Content-Type", "text/html; charset=utf-8")
    .with_header("Cache-Control", "no-store")
    .with_body(body)
}

fn escape_html(s: &str) -> String {
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
