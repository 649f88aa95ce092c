//! One logical browsing session plus the obstacle handling every platform
//! needs before page content can be trusted.
//!
//! The engine behind a session is abstracted by [`Driver`]; [`AutomationSession`]
//! layers explicit per-operation timeouts, challenge resolution, and modal
//! dismissal on top of it.

pub mod dom;
pub mod http;
#[cfg(test)]
pub mod testing;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

pub use dom::Element;

/// Upper bound on consecutive "continue" clicks while clearing a modal.
const MODAL_MAX_CLICKS: u32 = 5;

// ── Errors ──

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionErrorKind {
    Timeout,
    /// The requested element or page is absent.
    NotFound,
    /// The engine is gone; the session must be recreated.
    Crashed,
    /// Network failure or a retryable non-success status.
    Transport,
    /// Request that will not succeed on retry (bad status, bad selector).
    Rejected,
}

impl fmt::Display for SessionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionErrorKind::Timeout => "timeout",
            SessionErrorKind::NotFound => "not found",
            SessionErrorKind::Crashed => "crashed",
            SessionErrorKind::Transport => "transport",
            SessionErrorKind::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Error)]
#[error("session {kind}: {detail}")]
pub struct SessionError {
    pub kind: SessionErrorKind,
    pub detail: String,
}

impl SessionError {
    pub fn new(kind: SessionErrorKind, detail: impl Into<String>) -> Self {
        SessionError {
            kind,
            detail: detail.into(),
        }
    }

    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::new(SessionErrorKind::NotFound, detail)
    }

    pub fn timeout(detail: impl Into<String>) -> Self {
        Self::new(SessionErrorKind::Timeout, detail)
    }

    pub fn crashed(detail: impl Into<String>) -> Self {
        Self::new(SessionErrorKind::Crashed, detail)
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == SessionErrorKind::NotFound
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("challenge not cleared after {iterations} checks")]
pub struct ChallengeTimeout {
    pub iterations: u32,
}

/// Anything that can go wrong while reading a page through a session.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Challenge(#[from] ChallengeTimeout),
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Session(e) => matches!(
                e.kind,
                SessionErrorKind::Timeout | SessionErrorKind::Transport | SessionErrorKind::Crashed
            ),
            FetchError::Challenge(_) => true,
        }
    }

    /// Crashed engines and uncleared challenges leave the session unusable.
    pub fn needs_fresh_session(&self) -> bool {
        match self {
            FetchError::Session(e) => e.kind == SessionErrorKind::Crashed,
            FetchError::Challenge(_) => true,
        }
    }
}

/// Treat "element absent" as `None`; every other failure still propagates.
pub trait AbsentOk<T> {
    fn absent_ok(self) -> Result<Option<T>, SessionError>;
}

impl<T> AbsentOk<T> for Result<T, SessionError> {
    fn absent_ok(self) -> Result<Option<T>, SessionError> {
        match self {
            Ok(v) => Ok(Some(v)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

// ── Engine seam ──

/// Primitive browser operations; one instance backs one session.
#[async_trait]
pub trait Driver: Send {
    async fn navigate(&mut self, url: &str) -> Result<u16, SessionError>;
    async fn title(&mut self) -> Result<String, SessionError>;
    async fn current_url(&mut self) -> Result<String, SessionError>;
    async fn page_source(&mut self) -> Result<String, SessionError>;
    async fn find_all(&mut self, selector: &str) -> Result<Vec<Element>, SessionError>;
    async fn find_within(
        &mut self,
        parent: &Element,
        selector: &str,
    ) -> Result<Vec<Element>, SessionError>;
    async fn click(&mut self, element: &Element) -> Result<(), SessionError>;
    async fn type_text(&mut self, element: &Element, text: &str) -> Result<(), SessionError>;
    /// Interaction that clears an interstitial challenge page.
    async fn clear_challenge(&mut self) -> Result<(), SessionError>;
}

/// Explicit construction parameters for a session engine.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub user_agent: String,
    pub op_timeout: Duration,
    pub settle_delay: Duration,
}

impl SessionOptions {
    pub fn from_settings(settings: &crate::config::Settings) -> Self {
        SessionOptions {
            user_agent: settings.user_agent.clone(),
            op_timeout: settings.op_timeout(),
            settle_delay: Duration::from_millis(settings.settle_delay_ms),
        }
    }
}

/// Builds fresh engines; used again whenever a session must be recreated.
pub trait DriverFactory: Send + Sync {
    fn create(&self, options: &SessionOptions) -> Result<Box<dyn Driver>, SessionError>;
}

/// Title and control signatures of a platform's obstacles.
#[derive(Debug, Clone)]
pub struct ObstacleProfile {
    /// Lower-case title fragments that mean real content is showing.
    pub ready_titles: Vec<&'static str>,
    /// Lower-case title fragments of the interstitial challenge.
    pub challenge_titles: Vec<&'static str>,
    pub modal_selector: &'static str,
    pub max_iterations: u32,
    pub poll: Duration,
}

impl ObstacleProfile {
    /// With no ready signatures, any non-empty title that is not a challenge counts.
    fn is_ready(&self, title: &str, challenged: bool) -> bool {
        if self.ready_titles.is_empty() {
            !challenged && !title.trim().is_empty()
        } else {
            self.ready_titles.iter().any(|t| title.contains(t))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ready {
    /// Title checks spent before the page was ready.
    pub checks: u32,
}

// ── Session ──

async fn bounded<T, F>(timeout: Duration, what: &str, fut: F) -> Result<T, SessionError>
where
    F: std::future::Future<Output = Result<T, SessionError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(SessionError::timeout(format!("{} exceeded {:?}", what, timeout))),
    }
}

pub struct AutomationSession {
    driver: Box<dyn Driver>,
    options: SessionOptions,
}

impl AutomationSession {
    pub fn new(driver: Box<dyn Driver>, options: SessionOptions) -> Self {
        AutomationSession { driver, options }
    }

    pub fn create(factory: &dyn DriverFactory, options: &SessionOptions) -> Result<Self, SessionError> {
        Ok(Self::new(factory.create(options)?, options.clone()))
    }

    /// Navigate and wait for the page to settle.
    pub async fn open(&mut self, url: &str) -> Result<u16, SessionError> {
        debug!(url, "opening");
        let what = format!("navigate {}", url);
        let status = bounded(self.options.op_timeout, &what, self.driver.navigate(url)).await?;
        if !self.options.settle_delay.is_zero() {
            tokio::time::sleep(self.options.settle_delay).await;
        }
        Ok(status)
    }

    /// Check the title until it shows the platform, clearing challenges on the way.
    ///
    /// Performs exactly `max_iterations` title checks before giving up.
    pub async fn resolve_challenge(
        &mut self,
        profile: &ObstacleProfile,
    ) -> Result<Result<Ready, ChallengeTimeout>, SessionError> {
        for check in 1..=profile.max_iterations {
            let title = self.title().await?.to_lowercase();
            let challenged = profile.challenge_titles.iter().any(|t| title.contains(t));

            if profile.is_ready(&title, challenged) {
                debug!(%title, check, "page ready");
                return Ok(Ok(Ready { checks: check }));
            }

            if challenged {
                info!(check, "passing challenge");
                bounded(
                    self.options.op_timeout,
                    "challenge interaction",
                    self.driver.clear_challenge(),
                )
                .await?;
            } else {
                debug!(%title, check, "unrecognised title, waiting");
            }

            if check < profile.max_iterations && !profile.poll.is_zero() {
                tokio::time::sleep(profile.poll).await;
            }
        }

        warn!(iterations = profile.max_iterations, "challenge did not clear");
        Ok(Err(ChallengeTimeout {
            iterations: profile.max_iterations,
        }))
    }

    /// Click through a blocking modal if one is showing. Absence is not an error.
    pub async fn dismiss_modal(&mut self, profile: &ObstacleProfile) -> Result<(), SessionError> {
        for _ in 0..MODAL_MAX_CLICKS {
            let Some(control) = self.find_one(profile.modal_selector).await.absent_ok()? else {
                return Ok(());
            };
            if self.click(&control).await.absent_ok()?.is_none() {
                return Ok(());
            }
            debug!("dismissed modal");
        }
        Ok(())
    }

    /// Open a URL and clear every obstacle before handing back control.
    pub async fn open_clear(&mut self, url: &str, profile: &ObstacleProfile) -> Result<u16, FetchError> {
        let status = self.open(url).await?;
        self.clear_obstacles(profile).await?;
        Ok(status)
    }

    /// Challenge then modal, for pages reached by clicking rather than `open`.
    pub async fn clear_obstacles(&mut self, profile: &ObstacleProfile) -> Result<(), FetchError> {
        self.resolve_challenge(profile).await??;
        self.dismiss_modal(profile).await?;
        Ok(())
    }

    pub async fn title(&mut self) -> Result<String, SessionError> {
        bounded(self.options.op_timeout, "read title", self.driver.title()).await
    }

    pub async fn current_url(&mut self) -> Result<String, SessionError> {
        bounded(self.options.op_timeout, "read url", self.driver.current_url()).await
    }

    pub async fn page_source(&mut self) -> Result<String, SessionError> {
        bounded(self.options.op_timeout, "read page source", self.driver.page_source()).await
    }

    pub async fn find_all(&mut self, selector: &str) -> Result<Vec<Element>, SessionError> {
        bounded(self.options.op_timeout, selector, self.driver.find_all(selector)).await
    }

    /// First match for `selector`, or `NotFound`.
    pub async fn find_one(&mut self, selector: &str) -> Result<Element, SessionError> {
        self.find_all(selector)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| SessionError::not_found(selector.to_string()))
    }

    pub async fn find_within(
        &mut self,
        parent: &Element,
        selector: &str,
    ) -> Result<Vec<Element>, SessionError> {
        bounded(
            self.options.op_timeout,
            selector,
            self.driver.find_within(parent, selector),
        )
        .await
    }

    pub async fn click(&mut self, element: &Element) -> Result<(), SessionError> {
        bounded(self.options.op_timeout, "click", self.driver.click(element)).await
    }

    /// Click the first element matching any selector, in order.
    pub async fn click_first_of(&mut self, selectors: &[&str]) -> Result<Option<String>, SessionError> {
        for selector in selectors {
            if let Some(element) = self.find_one(selector).await.absent_ok()? {
                if self.click(&element).await.absent_ok()?.is_some() {
                    return Ok(Some(selector.to_string()));
                }
            }
        }
        Ok(None)
    }

    pub async fn type_text(&mut self, element: &Element, text: &str) -> Result<(), SessionError> {
        bounded(self.options.op_timeout, "type", self.driver.type_text(element, text)).await
    }
}
