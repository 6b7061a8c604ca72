use std::collections::HashSet;
use std::fs;
use std::io::Error as IoError;
use std::time::Duration;

use cookie::{Cookie, CookieJar};
use failure::Fail;
use reqwest::blocking::{Client, ClientBuilder, Response};
use reqwest::redirect::Policy;
use reqwest::{header, Error as ReqwestError, Method, StatusCode};
use tracing::{debug, error, info, warn};
use url::{ParseError, Url};

use crate::config::Settings;
use crate::forms::{find_form_value, find_text_by_class, parse_dom};

const LOGIN_PATH: &str = "/accounts/login/";
const LOGIN_PAGE_PATH: &str = "/accounts/login/?next=/";
const CSRF_COOKIE: &str = "csrftoken";
const CSRF_FIELD: &str = "csrfmiddlewaretoken";
const SESSION_COOKIE: &str = "sessionid";
const MAX_REDIRECTS: usize = 10;
/// The holdings report can take a long time to build; requests never time out.
const REQUEST_TIMEOUT: Option<Duration> = None;

#[derive(Fail, Debug)]
pub enum RequestError {
  #[fail(display = "{}", _0)]
  Reqwest(ReqwestError),
  #[fail(display = "Redirect ({}) without a usable Location header", _0)]
  MissingLocation(StatusCode),
  #[fail(display = "Redirect to an invalid location: {}", _0)]
  InvalidLocation(ParseError),
  #[fail(display = "Gave up after {} redirects", _0)]
  TooManyRedirects(usize),
}

#[derive(Fail, Debug)]
pub enum UnableToLogin {
  #[fail(display = "Cannot set up the http client: {}", _0)]
  ClientSetup(ReqwestError),
  #[fail(display = "Cannot open the login page: {}", _0)]
  LoginPage(RequestError),
  #[fail(display = "Error submitting the login form: {}", _0)]
  Request(RequestError),
  #[fail(display = "The portal returned an invalid document: {}", _0)]
  InvalidContent(IoError),
  #[fail(display = "Cannot build a portal url: {}", _0)]
  InvalidUrl(ParseError),
  #[fail(display = "There is no cookie with csrftoken")]
  MissingCsrfToken(),
}

/// One request as the caller wants it sent. Redirect hops are derived from it.
#[derive(Debug, Clone)]
pub struct PortalRequest {
  method: Method,
  url: Url,
  form: Option<Vec<(String, String)>>,
  referer: Option<String>,
}

impl PortalRequest {
  pub fn get(url: Url) -> Self {
    PortalRequest {
      method: Method::GET,
      url: url,
      form: None,
      referer: None,
    }
  }

  pub fn post_form(url: Url, form: Vec<(String, String)>) -> Self {
    PortalRequest {
      method: Method::POST,
      url: url,
      form: Some(form),
      referer: None,
    }
  }

  pub fn with_referer(mut self, referer: &Url) -> Self {
    self.referer = Some(referer.to_string());
    self
  }
}

/// The last response of a request, after redirects were followed.
#[derive(Debug)]
pub struct PortalResponse {
  pub url: Url,
  pub status: StatusCode,
  pub body: Vec<u8>,
}

impl PortalResponse {
  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }
}

pub struct CmwContainer {
  settings: Settings,
  client: Client,
  jar: CookieJar,
  // Cookies set without a Domain attribute; they go back to their origin host only.
  host_only: HashSet<String>,
  dump_count: u32,
}

pub struct CmwLoggedInUser<'a> {
  pub(crate) c: &'a mut CmwContainer,
}

/// Redirects are followed by hand so that cookies set on every hop reach the jar.
pub fn client_builder() -> ClientBuilder {
  Client::builder()
    .redirect(Policy::none())
    .timeout(REQUEST_TIMEOUT)
    .user_agent(concat!("cmw-portfolio/", env!("CARGO_PKG_VERSION")))
}

fn domain_matches(domain: &str, host: &str) -> bool {
  let d = domain.trim_start_matches('.').to_ascii_lowercase();
  let host = host.to_ascii_lowercase();
  host == d || (host.len() > d.len() && host.ends_with(&format!(".{}", d)))
}

impl CmwContainer {
  pub fn new(settings: Settings) -> Result<Self, UnableToLogin> {
    let client = client_builder()
      .build()
      .map_err(UnableToLogin::ClientSetup)?;
    Ok(Self::with_client(settings, client))
  }

  pub fn with_client(settings: Settings, client: Client) -> Self {
    CmwContainer {
      settings: settings,
      client: client,
      jar: CookieJar::new(),
      host_only: HashSet::new(),
      dump_count: 0,
    }
  }

  pub fn settings(&self) -> &Settings {
    &self.settings
  }

  #[cfg(test)]
  pub fn settings_mut(&mut self) -> &mut Settings {
    &mut self.settings
  }

  pub fn update_cookies(&mut self, origin: &Url, response: &Response) {
    let raw: Vec<String> = response
      .headers()
      .get_all(header::SET_COOKIE)
      .iter()
      .filter_map(|value| value.to_str().ok())
      .map(|value| value.to_owned())
      .collect();
    raw.into_iter().for_each(|value| self.store_cookie(origin, value));
  }

  /// Stores a `Set-Cookie` received from `origin`. Every stored cookie carries
  /// a domain: its own when it names one, the origin host otherwise.
  pub fn store_cookie(&mut self, origin: &Url, raw: String) {
    let host = origin.host_str().unwrap_or_default().to_ascii_lowercase();
    let mut c = match Cookie::parse(raw) {
      Ok(c) => c,
      Err(e) => {
        debug!(error = %e, "ignoring unparseable Set-Cookie header");
        return;
      }
    };

    let domain = c.domain().map(|d| d.trim_start_matches('.').to_ascii_lowercase());
    let host_only = match domain {
      Some(d) if domain_matches(&d, &host) => {
        c.set_domain(d);
        false
      }
      Some(d) => {
        debug!(name = c.name(), domain = %d, origin = %host, "ignoring cookie for a foreign domain");
        return;
      }
      None => {
        c.set_domain(host);
        true
      }
    };

    let expired = c
      .max_age()
      .map(|age| age.is_zero() || age.is_negative())
      .unwrap_or(false);
    debug!(name = c.name(), expired, host_only, "storing cookie");
    self.host_only.remove(c.name());
    if expired {
      self.jar.remove(c);
    } else {
      if host_only {
        self.host_only.insert(c.name().to_owned());
      }
      self.jar.add(c);
    }
  }

  pub fn cookie(&self, name: &str) -> Option<&str> {
    self.jar.get(name).map(|c| c.value())
  }

  pub fn get_cookies(&self, url: &Url) -> Vec<(String, String)> {
    let host = url.host_str().unwrap_or_default();
    let https = url.scheme() == "https";
    let mut cookies: Vec<(String, String)> = self
      .jar
      .iter()
      .filter(|cookie| https || !cookie.secure().unwrap_or(false))
      .filter(|cookie| {
        let domain = cookie.domain().unwrap_or_default();
        if self.host_only.contains(cookie.name()) {
          host.eq_ignore_ascii_case(domain)
        } else {
          domain_matches(domain, host)
        }
      })
      .map(|cookie| (cookie.name().to_owned(), cookie.value().to_owned()))
      .collect();
    cookies.sort();
    cookies
  }

  fn dump(&mut self, step: &str, body: &[u8]) {
    let dir = match self.settings.dump_dir {
      Some(ref dir) => dir.clone(),
      None => return,
    };
    self.dump_count += 1;
    let path = dir.join(format!("{}-{}.txt", step, self.dump_count));
    match fs::write(&path, body) {
      Ok(()) => debug!(path = %path.display(), "dumped response body"),
      Err(e) => warn!(path = %path.display(), error = %e, "cannot dump response body"),
    }
  }

  pub fn get_document(&mut self, step: &str, request: PortalRequest) -> Result<PortalResponse, RequestError> {
    let PortalRequest {
      mut method,
      mut url,
      mut form,
      referer,
    } = request;

    for hop in 0..=MAX_REDIRECTS {
      let mut rb = self.client.request(method.clone(), url.clone());
      let cookies = self.get_cookies(&url);
      if !cookies.is_empty() {
        let cookie_header = cookies
          .iter()
          .map(|(n, v)| format!("{}={}", n, v))
          .collect::<Vec<_>>()
          .join("; ");
        rb = rb.header(header::COOKIE, cookie_header);
      }
      if let Some(ref referer) = referer {
        rb = rb.header(header::REFERER, referer.as_str());
      }
      if let Some(ref params) = form {
        rb = rb.form(params);
      }

      debug!(step, %method, %url, hop, "sending request");
      let res = rb.send().map_err(RequestError::Reqwest)?;
      self.update_cookies(&url, &res);
      let status = res.status();

      match status {
        StatusCode::MOVED_PERMANENTLY
        | StatusCode::FOUND
        | StatusCode::SEE_OTHER
        | StatusCode::TEMPORARY_REDIRECT
        | StatusCode::PERMANENT_REDIRECT => {
          let location = res
            .headers()
            .get(header::LOCATION)
            .and_then(|value| value.to_str().ok())
            .ok_or(RequestError::MissingLocation(status))?;
          let next = url.join(location).map_err(RequestError::InvalidLocation)?;
          debug!(step, %status, from = %url, to = %next, "following redirect");
          let keeps_method = status == StatusCode::TEMPORARY_REDIRECT || status == StatusCode::PERMANENT_REDIRECT;
          if !keeps_method && (status == StatusCode::SEE_OTHER || method == Method::POST) {
            method = Method::GET;
            form = None;
          }
          url = next;
        }
        _ => {
          let body = res.bytes().map_err(RequestError::Reqwest)?.to_vec();
          if status.is_success() {
            info!(step, %status, bytes = body.len(), "fetched");
          } else {
            warn!(step, %status, %url, "portal answered with a non-success status");
          }
          self.dump(step, &body);
          return Ok(PortalResponse {
            url: url,
            status: status,
            body: body,
          });
        }
      }
    }
    Err(RequestError::TooManyRedirects(MAX_REDIRECTS))
  }

  /// Opens an anonymous session; the portal answers with the csrftoken cookie.
  pub fn get_login_page(&mut self) -> Result<PortalResponse, UnableToLogin> {
    let url = self
      .settings
      .endpoint(LOGIN_PAGE_PATH)
      .map_err(UnableToLogin::InvalidUrl)?;
    self
      .get_document("login-page", PortalRequest::get(url))
      .map_err(UnableToLogin::LoginPage)
  }

  pub fn csrf_token(&self, login_page: &PortalResponse) -> Result<String, UnableToLogin> {
    if let Some(token) = self.cookie(CSRF_COOKIE).filter(|t| !t.is_empty()) {
      return Ok(token.to_owned());
    }
    let dom = parse_dom(login_page.text()).map_err(UnableToLogin::InvalidContent)?;
    match find_form_value(&dom, CSRF_FIELD).filter(|t| !t.is_empty()) {
      Some(token) => {
        info!("no csrftoken cookie; using the login form's token");
        Ok(token)
      }
      None => Err(UnableToLogin::MissingCsrfToken()),
    }
  }

  pub fn login_form(&self, csrf_token: &str) -> Vec<(String, String)> {
    vec![
      (CSRF_FIELD.to_owned(), csrf_token.to_owned()),
      ("login".to_owned(), self.settings.username.clone()),
      ("password".to_owned(), self.settings.password.clone()),
      ("remember".to_owned(), "1".to_owned()),
      ("next".to_owned(), "/".to_owned()),
    ]
  }

  fn submit_credentials(&mut self, csrf_token: &str) -> Result<PortalResponse, UnableToLogin> {
    let login_url = self
      .settings
      .endpoint(LOGIN_PATH)
      .map_err(UnableToLogin::InvalidUrl)?;
    let referer = self
      .settings
      .endpoint(LOGIN_PAGE_PATH)
      .map_err(UnableToLogin::InvalidUrl)?;
    let request = PortalRequest::post_form(login_url, self.login_form(csrf_token)).with_referer(&referer);
    self
      .get_document("login", request)
      .map_err(UnableToLogin::Request)
  }

  /// Only a hint for the log: the reports are requested either way.
  fn check_session(&self, res: &PortalResponse) {
    if self.cookie(SESSION_COOKIE).is_some() {
      info!(user = %self.settings.username, landed_on = %res.url, "logged in");
      return;
    }
    let errors = parse_dom(res.text())
      .map(|dom| find_text_by_class(&dom, "errorlist"))
      .unwrap_or_default();
    if errors.is_empty() {
      warn!(status = %res.status, landed_on = %res.url, "no {} cookie after login", SESSION_COOKIE);
    } else {
      warn!(portal_says = %errors.join("; "), "login may have been rejected");
    }
  }

  /// Fails only when the anonymous session cannot be opened or carries no
  /// CSRF token. A failed login POST is logged and the handle is returned
  /// anyway.
  pub fn do_login(&mut self) -> Result<CmwLoggedInUser, UnableToLogin> {
    let page = self.get_login_page()?;
    let token = self.csrf_token(&page)?;

    match self.submit_credentials(&token) {
      Ok(res) => self.check_session(&res),
      Err(e) => error!(error = %e, "login failed; continuing with the anonymous session"),
    }
    Ok(CmwLoggedInUser { c: self })
  }
}
