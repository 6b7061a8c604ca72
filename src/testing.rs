//! A throwaway HTTP/1.1 server standing in for the portal in tests.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;

use chrono::NaiveDate;
use url::{form_urlencoded, Url};

use crate::config::Settings;

pub const MASTER_VALUES_JSON: &str = r#"{"equity":61.5,"debt":38.5}"#;
pub const HOLDINGS_JSON: &str = r#"[{"isin":"INF200K01RJ1","units":"12.5"}]"#;

const LOGIN_PAGE: &str = r#"<html><body>
<form class="login" method="POST" action="/accounts/login/">
  <input type="hidden" name="csrfmiddlewaretoken" value="tok-123">
  <input type="text" name="login"><input type="password" name="password">
</form></body></html>"#;

const LOGIN_FAILED_PAGE: &str = r#"<html><body>
<form class="login" method="POST" action="/accounts/login/">
  <ul class="errorlist"><li>The e-mail address and/or password you specified are not correct.</li></ul>
  <input type="hidden" name="csrfmiddlewaretoken" value="tok-123">
</form></body></html>"#;

pub fn settings_for(base: &str) -> Settings {
  Settings {
    username: "jane".to_owned(),
    password: "hunter2".to_owned(),
    client_id: "C1234".to_owned(),
    base_url: Url::parse(base).unwrap(),
    report_date: NaiveDate::from_ymd_opt(2024, 3, 9).unwrap(),
    dump_dir: None,
  }
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
  pub method: String,
  pub target: String,
  pub headers: Vec<(String, String)>,
  pub body: String,
}

impl RecordedRequest {
  pub fn header(&self, name: &str) -> Option<String> {
    self
      .headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.clone())
  }

  pub fn form_value(&self, name: &str) -> Option<String> {
    form_urlencoded::parse(self.body.as_bytes())
      .find(|(n, _)| n == name)
      .map(|(_, v)| v.into_owned())
  }
}

#[derive(Debug, Clone)]
pub struct StubResponse {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: String,
}

impl StubResponse {
  pub fn ok(body: &str) -> Self {
    StubResponse {
      status: 200,
      headers: vec![],
      body: body.to_owned(),
    }
  }

  pub fn status(status: u16, body: &str) -> Self {
    StubResponse {
      status: status,
      headers: vec![],
      body: body.to_owned(),
    }
  }

  pub fn redirect(status: u16, location: &str) -> Self {
    StubResponse::status(status, "").with_header("Location", location)
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_owned(), value.to_owned()));
    self
  }
}

pub struct StubPortal {
  pub base_url: String,
  requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl StubPortal {
  pub fn start<F>(handler: F) -> Self
  where
    F: Fn(&RecordedRequest) -> StubResponse + Send + 'static,
  {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let requests = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&requests);

    thread::spawn(move || {
      for stream in listener.incoming() {
        let stream = match stream {
          Ok(stream) => stream,
          Err(_) => continue,
        };
        if let Some(req) = read_request(&stream) {
          let res = handler(&req);
          seen.lock().unwrap().push(req);
          let _ = write_response(stream, &res);
        }
      }
    });

    StubPortal {
      base_url: format!("http://{}", addr),
      requests: requests,
    }
  }

  pub fn start_django_like() -> Self {
    Self::start(django_like)
  }

  pub fn requests(&self) -> Vec<RecordedRequest> {
    self.requests.lock().unwrap().clone()
  }
}

/// Serves the login flow and both reports the way the real portal does:
/// csrftoken on the login page, sessionid plus a rotated csrftoken on a 302
/// after a good login, and 403 from the api without a session.
pub fn django_like(req: &RecordedRequest) -> StubResponse {
  let cookie = req.header("cookie").unwrap_or_default();
  match (req.method.as_str(), req.target.as_str()) {
    ("GET", "/accounts/login/?next=/") => {
      StubResponse::ok(LOGIN_PAGE).with_header("Set-Cookie", "csrftoken=tok-123; Path=/; SameSite=Lax")
    }
    ("POST", "/accounts/login/") => {
      let accepted = cookie.contains("csrftoken=tok-123")
        && req.form_value("csrfmiddlewaretoken").as_deref() == Some("tok-123")
        && req.form_value("login").as_deref() == Some("jane")
        && req.form_value("password").as_deref() == Some("hunter2")
        && req.form_value("remember").as_deref() == Some("1");
      if accepted {
        StubResponse::redirect(302, "/")
          .with_header("Set-Cookie", "sessionid=sess-456; HttpOnly; Path=/")
          .with_header("Set-Cookie", "csrftoken=rotated-789; Path=/")
      } else {
        StubResponse::ok(LOGIN_FAILED_PAGE)
      }
    }
    ("GET", "/") => StubResponse::ok("<html><body>dashboard</body></html>"),
    ("GET", target) if target.starts_with("/api/") => {
      if !cookie.contains("sessionid=sess-456") {
        return StubResponse::status(403, r#"{"detail":"Authentication credentials were not provided."}"#);
      }
      match target {
        "/api/client/portfolio/daily_master_values/C1234" => StubResponse::ok(MASTER_VALUES_JSON),
        "/api/client/portfolio/holdings/client/daily/report/C1234?given_date=2024-03-09" => {
          StubResponse::ok(HOLDINGS_JSON)
        }
        _ => StubResponse::status(404, r#"{"detail":"Not found."}"#),
      }
    }
    _ => StubResponse::status(404, "not found"),
  }
}

fn read_request(stream: &TcpStream) -> Option<RecordedRequest> {
  let mut reader = BufReader::new(stream);
  let mut line = String::new();
  reader.read_line(&mut line).ok()?;
  let mut parts = line.split_whitespace();
  let method = parts.next()?.to_owned();
  let target = parts.next()?.to_owned();

  let mut headers = Vec::new();
  loop {
    let mut raw = String::new();
    reader.read_line(&mut raw).ok()?;
    let raw = raw.trim_end();
    if raw.is_empty() {
      break;
    }
    if let Some((name, value)) = raw.split_once(':') {
      headers.push((name.trim().to_ascii_lowercase(), value.trim().to_owned()));
    }
  }

  let len = headers
    .iter()
    .find(|(n, _)| n == "content-length")
    .and_then(|(_, v)| v.parse::<usize>().ok())
    .unwrap_or(0);
  let mut body = vec![0u8; len];
  reader.read_exact(&mut body).ok()?;

  Some(RecordedRequest {
    method: method,
    target: target,
    headers: headers,
    body: String::from_utf8_lossy(&body).into_owned(),
  })
}

fn write_response(mut stream: TcpStream, res: &StubResponse) -> io::Result<()> {
  let mut out = format!("HTTP/1.1 {} Stub\r\n", res.status);
  for (name, value) in &res.headers {
    out.push_str(&format!("{}: {}\r\n", name, value));
  }
  out.push_str(&format!(
    "Content-Length: {}\r\nConnection: close\r\n\r\n",
    res.body.len()
  ));
  out.push_str(&res.body);
  stream.write_all(out.as_bytes())?;
  stream.flush()
}
