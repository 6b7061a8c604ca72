mod config;
mod forms;
mod login;
mod reports;
#[cfg(test)]
mod testing;

use std::io::{self, Write};
use std::process;

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use config::Settings;
use login::{CmwContainer, UnableToLogin};
use reports::Report;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Outcome {
  /// Every step ran; individual report failures were logged.
  Finished,
  /// The anonymous session or its CSRF token could not be obtained.
  Aborted,
}

impl Outcome {
  fn exit_code(self) -> i32 {
    match self {
      Outcome::Finished => 0,
      Outcome::Aborted => 1,
    }
  }
}

fn init_tracing() {
  let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
  tracing_subscriber::registry()
    .with(env_filter)
    .with(
      tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_target(false),
    )
    .init();
}

/// `out` carries nothing but the portal's bytes.
fn emit<W: Write>(out: &mut W, body: &[u8]) -> io::Result<()> {
  out.write_all(body)?;
  out.flush()
}

/// Login, then both reports in printing order.
fn run<W: Write>(container: &mut CmwContainer, out: &mut W) -> Outcome {
  let mut user = match container.do_login() {
    Ok(user) => user,
    Err(UnableToLogin::MissingCsrfToken()) => {
      error!("there is no cookie with csrftoken");
      return Outcome::Aborted;
    }
    Err(e) => {
      error!(error = %e, "cannot open a session");
      return Outcome::Aborted;
    }
  };

  for report in Report::ALL.iter().copied() {
    match user.fetch(report) {
      Ok(body) => {
        if let Err(e) = emit(out, &body) {
          error!(report = report.step(), error = %e, "cannot write report to stdout");
        }
      }
      Err(e) => error!(report = report.step(), error = %e, "cannot fetch report"),
    }
  }
  Outcome::Finished
}

fn main() {
  dotenvy::dotenv().ok();
  init_tracing();

  let settings = match Settings::from_env() {
    Ok(settings) => settings,
    Err(e) => {
      error!(error = %e, "cannot load settings");
      return;
    }
  };
  info!(settings = ?settings, "starting");

  let mut container = match CmwContainer::new(settings) {
    Ok(container) => container,
    Err(e) => {
      error!(error = %e, "cannot start a session");
      return;
    }
  };

  let stdout = io::stdout();
  let mut out = stdout.lock();
  let outcome = run(&mut container, &mut out);
  if outcome == Outcome::Aborted {
    process::exit(outcome.exit_code());
  }
}
