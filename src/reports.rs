use failure::Fail;
use url::{ParseError, Url};

use crate::config::Settings;
use crate::login::{CmwLoggedInUser, PortalRequest, RequestError};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Report {
  /// Current allocation across asset classes.
  DailyMasterValues,
  /// Holdings as of the configured report date.
  DailyHoldings,
}

#[derive(Fail, Debug)]
pub enum UnableToFetchReport {
  #[fail(display = "Cannot build the {} url: {}", _0, _1)]
  InvalidUrl(&'static str, ParseError),
  #[fail(display = "Error fetching {}: {}", _0, _1)]
  Request(&'static str, RequestError),
}

impl Report {
  /// Printing order.
  pub const ALL: [Report; 2] = [Report::DailyMasterValues, Report::DailyHoldings];

  pub fn step(self) -> &'static str {
    match self {
      Report::DailyMasterValues => "daily-master-values",
      Report::DailyHoldings => "daily-holdings",
    }
  }

  fn prefix(self) -> &'static str {
    match self {
      Report::DailyMasterValues => "/api/client/portfolio/daily_master_values",
      Report::DailyHoldings => "/api/client/portfolio/holdings/client/daily/report",
    }
  }

  pub fn url(self, settings: &Settings) -> Result<Url, ParseError> {
    let mut url = settings.endpoint(self.prefix())?;
    url
      .path_segments_mut()
      .map_err(|_| ParseError::RelativeUrlWithCannotBeABaseBase)?
      .pop_if_empty()
      .push(&settings.client_id);
    if self == Report::DailyHoldings {
      url
        .query_pairs_mut()
        .append_pair("given_date", &settings.report_date_param());
    }
    Ok(url)
  }
}

impl<'a> CmwLoggedInUser<'a> {
  /// The raw response body, whatever the status; the portal's JSON error
  /// bodies are as useful to the reader as the reports themselves.
  pub fn fetch(&mut self, report: Report) -> Result<Vec<u8>, UnableToFetchReport> {
    let step = report.step();
    let url = report
      .url(self.c.settings())
      .map_err(|e| UnableToFetchReport::InvalidUrl(step, e))?;
    self
      .c
      .get_document(step, PortalRequest::get(url))
      .map(|res| res.body)
      .map_err(|e| UnableToFetchReport::Request(step, e))
  }
}
