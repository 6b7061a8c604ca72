use std::env;
use std::fmt;
use std::path::PathBuf;

use chrono::{Local, NaiveDate};
use failure::Fail;
use url::{ParseError, Url};

const DEFAULT_BASE_URL: &str = "https://progress.capitalmindwealth.com";
const REPORT_DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Fail, Debug)]
pub enum ConfigError {
  #[fail(display = "Environment variable {} is not set", _0)]
  MissingVariable(&'static str),
  #[fail(display = "CMW_BASE_URL is not a usable base url: {}", _0)]
  InvalidBaseUrl(String),
  #[fail(display = "CMW_REPORT_DATE must look like YYYY-MM-DD, got {:?}", _0)]
  InvalidReportDate(String),
}

/// Everything one run needs to know, read once at startup.
pub struct Settings {
  pub username: String,
  pub password: String,
  pub client_id: String,
  pub base_url: Url,
  pub report_date: NaiveDate,
  pub dump_dir: Option<PathBuf>,
}

impl fmt::Debug for Settings {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    f.debug_struct("Settings")
      .field("username", &self.username)
      .field("password", &"<redacted>")
      .field("client_id", &self.client_id)
      .field("base_url", &self.base_url.as_str())
      .field("report_date", &self.report_date)
      .field("dump_dir", &self.dump_dir)
      .finish()
  }
}

impl Settings {
  /// Reads the process environment; `.env` is expected to be loaded already.
  pub fn from_env() -> Result<Self, ConfigError> {
    Self::from_lookup(|key| env::var(key).ok())
  }

  pub fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> Result<Self, ConfigError> {
    let optional = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
    let required = |key: &'static str| optional(key).ok_or(ConfigError::MissingVariable(key));

    let base_url = parse_base_url(&optional("CMW_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_owned()))?;
    let report_date = match optional("CMW_REPORT_DATE") {
      Some(raw) => NaiveDate::parse_from_str(raw.trim(), REPORT_DATE_FORMAT)
        .map_err(|_| ConfigError::InvalidReportDate(raw))?,
      None => Local::now().date_naive(),
    };

    Ok(Settings {
      username: required("MY_USERNAME")?,
      password: required("MY_PASSWORD")?,
      client_id: required("MY_CLIENTID")?,
      base_url: base_url,
      report_date: report_date,
      dump_dir: optional("CMW_DUMP_DIR").map(PathBuf::from),
    })
  }

  /// `path_and_query` must start with a slash; it is appended to the base url,
  /// keeping any path prefix the base carries.
  pub fn endpoint(&self, path_and_query: &str) -> Result<Url, ParseError> {
    Url::parse(&format!(
      "{}{}",
      self.base_url.as_str().trim_end_matches('/'),
      path_and_query
    ))
  }

  pub fn report_date_param(&self) -> String {
    self.report_date.format(REPORT_DATE_FORMAT).to_string()
  }
}

fn parse_base_url(raw: &str) -> Result<Url, ConfigError> {
  // Trailing slashes would double up when paths are appended.
  let url = Url::parse(raw.trim().trim_end_matches('/')).map_err(|e| ConfigError::InvalidBaseUrl(e.to_string()))?;
  if url.cannot_be_a_base() || url.host_str().is_none() {
    return Err(ConfigError::InvalidBaseUrl(raw.to_owned()));
  }
  Ok(url)
}
