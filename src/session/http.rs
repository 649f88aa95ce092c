use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use tracing::debug;

use super::dom::{self, Element, FormSubmission};
use super::{Driver, DriverFactory, SessionError, SessionErrorKind, SessionOptions};

/// Server-rendered page engine: plain HTTP with a cookie jar, links and
/// forms followed by resolving them against the current document.
pub struct HttpDriver {
    client: Client,
    url: Option<Url>,
    html: String,
    status: u16,
    typed: HashMap<String, String>,
}

impl HttpDriver {
    pub fn new(options: &SessionOptions) -> Result<Self, SessionError> {
        let client = Client::builder()
            .cookie_store(true)
            .timeout(options.op_timeout)
            .connect_timeout(Duration::from_secs(10))
            .user_agent(options.user_agent.clone())
            .build()
            .map_err(|e| SessionError::crashed(format!("failed to build client: {}", e)))?;
        Ok(HttpDriver {
            client,
            url: None,
            html: String::new(),
            status: 0,
            typed: HashMap::new(),
        })
    }

    fn resolve_url(&self, href: &str) -> Result<Url, SessionError> {
        let joined = match &self.url {
            Some(base) => base.join(href),
            None => Url::parse(href),
        };
        joined.map_err(|e| {
            SessionError::new(SessionErrorKind::Rejected, format!("bad url {}: {}", href, e))
        })
    }

    async fn load(&mut self, request: reqwest::RequestBuilder) -> Result<u16, SessionError> {
        let response = request.send().await.map_err(classify)?;
        let status = response.status();
        let final_url = response.url().clone();
        let body = response.text().await.map_err(classify)?;

        // Keep the document either way so challenge pages can be inspected.
        self.url = Some(final_url);
        self.html = body;
        self.status = status.as_u16();
        self.typed.clear();

        check_status(status)?;
        Ok(self.status)
    }

    async fn submit(&mut self, form: FormSubmission) -> Result<(), SessionError> {
        let action = if form.action.is_empty() {
            self.current()?.clone()
        } else {
            self.resolve_url(&form.action)?
        };
        debug!(%action, method = %form.method, fields = form.fields.len(), "submitting form");
        let request = if form.method == "post" {
            self.client.post(action).form(&form.fields)
        } else {
            self.client.get(action).query(&form.fields)
        };
        self.load(request).await.map(|_| ())
    }

    fn current(&self) -> Result<&Url, SessionError> {
        self.url
            .as_ref()
            .ok_or_else(|| SessionError::not_found("no page loaded"))
    }
}

fn classify(e: reqwest::Error) -> SessionError {
    if e.is_timeout() {
        SessionError::timeout(e.to_string())
    } else {
        SessionError::new(SessionErrorKind::Transport, e.to_string())
    }
}

fn check_status(status: StatusCode) -> Result<(), SessionError> {
    if status.is_success() {
        return Ok(());
    }
    let retryable = status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        // Challenge interstitials are commonly served as 403/503.
        || status == StatusCode::FORBIDDEN;
    let kind = if retryable {
        SessionErrorKind::Transport
    } else {
        SessionErrorKind::Rejected
    };
    Err(SessionError::new(kind, format!("HTTP {}", status)))
}

#[async_trait]
impl Driver for HttpDriver {
    async fn navigate(&mut self, url: &str) -> Result<u16, SessionError> {
        let target = self.resolve_url(url)?;
        let request = self.client.get(target);
        match self.load(request).await {
            // A 403 challenge page still gets inspected by the session.
            Err(e) if self.status == StatusCode::FORBIDDEN.as_u16() => {
                debug!(error = %e, "challenge-like status, keeping page");
                Ok(self.status)
            }
            other => other,
        }
    }

    async fn title(&mut self) -> Result<String, SessionError> {
        self.current()?;
        Ok(dom::title(&self.html))
    }

    async fn current_url(&mut self) -> Result<String, SessionError> {
        Ok(self.current()?.to_string())
    }

    async fn page_source(&mut self) -> Result<String, SessionError> {
        self.current()?;
        Ok(self.html.clone())
    }

    async fn find_all(&mut self, selector: &str) -> Result<Vec<Element>, SessionError> {
        dom::select(&self.html, selector)
    }

    async fn find_within(
        &mut self,
        parent: &Element,
        selector: &str,
    ) -> Result<Vec<Element>, SessionError> {
        dom::select_within(&self.html, parent, selector)
    }

    async fn click(&mut self, element: &Element) -> Result<(), SessionError> {
        if !dom::exists(&self.html, element) {
            return Err(SessionError::not_found(format!("stale element <{}>", element.tag)));
        }
        if let Some((target, argument)) = element.postback() {
            return match dom::postback_submission(&self.html, &target, &argument, &self.typed) {
                Some(form) => self.submit(form).await,
                None => Err(SessionError::not_found("postback without form")),
            };
        }
        if let Some(href) = element.href() {
            if !href.starts_with('#') && !href.starts_with("javascript:") {
                let target = self.resolve_url(href)?;
                return self.load(self.client.get(target)).await.map(|_| ());
            }
        }
        if let Some(form) = dom::submission_for(&self.html, element, &self.typed) {
            return self.submit(form).await;
        }
        // Client-side widgets (menus, tabs) have nothing to do server-side.
        Ok(())
    }

    async fn type_text(&mut self, element: &Element, text: &str) -> Result<(), SessionError> {
        let name = element
            .attr("name")
            .ok_or_else(|| SessionError::not_found("input without a name"))?;
        self.typed.insert(name.to_string(), text.to_string());
        Ok(())
    }

    async fn clear_challenge(&mut self) -> Result<(), SessionError> {
        // Cookies set by the interstitial are replayed on the reload.
        let current = self.current()?.clone();
        match self.load(self.client.get(current)).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind == SessionErrorKind::Transport => Ok(()),
            Err(e) => Err(e),
        }
    }
}

pub struct HttpDriverFactory;

impl DriverFactory for HttpDriverFactory {
    fn create(&self, options: &SessionOptions) -> Result<Box<dyn Driver>, SessionError> {
        Ok(Box::new(HttpDriver::new(options)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(check_status(StatusCode::OK).is_ok());
        assert_eq!(
            check_status(StatusCode::SERVICE_UNAVAILABLE).unwrap_err().kind,
            SessionErrorKind::Transport
        );
        assert_eq!(
            check_status(StatusCode::TOO_MANY_REQUESTS).unwrap_err().kind,
            SessionErrorKind::Transport
        );
        assert_eq!(
            check_status(StatusCode::NOT_FOUND).unwrap_err().kind,
            SessionErrorKind::Rejected
        );
    }

    #[tokio::test]
    async fn unloaded_driver_reports_absence() {
        let options = SessionOptions {
            user_agent: "test".into(),
            op_timeout: Duration::from_secs(1),
            settle_delay: Duration::ZERO,
        };
        let mut driver = HttpDriver::new(&options).unwrap();
        assert!(driver.title().await.unwrap_err().is_not_found());
        assert!(driver.find_all("a").await.unwrap().is_empty());
    }
}
