//! In-memory engine for tests: serves scripted HTML per URL, injects
//! failures, and counts every interaction.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;

use super::dom::{self, Element, FormSubmission};
use super::{Driver, DriverFactory, SessionError, SessionErrorKind, SessionOptions};

const STUCK: u32 = u32::MAX;

type FormHandler = Arc<dyn Fn(&FormSubmission) -> String + Send + Sync>;

#[derive(Default)]
struct State {
    pages: HashMap<String, String>,
    challenge_remaining: u32,
    modal_clears: bool,
    hidden: HashSet<String>,
    click_failure: Option<SessionErrorKind>,
    nav_failures: VecDeque<(String, SessionErrorKind)>,
    form_handler: Option<FormHandler>,
    challenges_on: Vec<(String, u32)>,
    navigations: Vec<String>,
    title_checks: u32,
    challenge_clicks: u32,
    clicks: u32,
    creations: u32,
}

/// Shared script; clones observe the same pages and counters.
#[derive(Clone, Default)]
pub struct Script {
    state: Arc<Mutex<State>>,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub fn page(&self, url: &str, html: &str) {
        self.with(|s| s.pages.insert(url.to_string(), html.to_string()));
    }

    pub fn stuck_on_challenge(&self) {
        self.with(|s| s.challenge_remaining = STUCK);
    }

    pub fn challenge_for(&self, clicks: u32) {
        self.with(|s| s.challenge_remaining = clicks);
    }

    /// Put a challenge in front of every page whose URL contains `pattern`.
    pub fn challenge_on(&self, pattern: &str, clicks: u32) {
        self.with(|s| s.challenges_on.push((pattern.to_string(), clicks)));
    }

    pub fn modal_clears_on_click(&self) {
        self.with(|s| s.modal_clears = true);
    }

    pub fn fail_clicks(&self, kind: SessionErrorKind) {
        self.with(|s| s.click_failure = Some(kind));
    }

    /// Fail the next navigation whose URL contains `pattern`.
    pub fn fail_navigation(&self, pattern: &str, kind: SessionErrorKind) {
        self.with(|s| s.nav_failures.push_back((pattern.to_string(), kind)));
    }

    pub fn on_form(&self, handler: impl Fn(&FormSubmission) -> String + Send + Sync + 'static) {
        self.with(|s| s.form_handler = Some(Arc::new(handler)));
    }

    pub fn title_checks(&self) -> u32 {
        self.with(|s| s.title_checks)
    }

    pub fn challenge_clicks(&self) -> u32 {
        self.with(|s| s.challenge_clicks)
    }

    pub fn clicks(&self) -> u32 {
        self.with(|s| s.clicks)
    }

    pub fn creations(&self) -> u32 {
        self.with(|s| s.creations)
    }

    pub fn navigations(&self) -> Vec<String> {
        self.with(|s| s.navigations.clone())
    }

    /// Navigations whose URL contains `pattern`.
    pub fn navigations_to(&self, pattern: &str) -> usize {
        self.with(|s| s.navigations.iter().filter(|u| u.contains(pattern)).count())
    }
}

pub fn options() -> SessionOptions {
    SessionOptions {
        user_agent: "test".into(),
        op_timeout: Duration::from_secs(5),
        settle_delay: Duration::ZERO,
    }
}

pub struct ScriptedDriver {
    script: Script,
    url: Option<String>,
    html: String,
    typed: HashMap<String, String>,
    dead: bool,
}

impl ScriptedDriver {
    pub fn new(script: Script) -> Self {
        ScriptedDriver {
            script,
            url: None,
            html: String::new(),
            typed: HashMap::new(),
            dead: false,
        }
    }

    fn alive(&self) -> Result<(), SessionError> {
        if self.dead {
            Err(SessionError::crashed("scripted engine is dead"))
        } else {
            Ok(())
        }
    }

    fn resolve(&self, href: &str) -> String {
        match self.url.as_deref().and_then(|u| Url::parse(u).ok()) {
            Some(base) => base.join(href).map(|u| u.to_string()).unwrap_or_else(|_| href.to_string()),
            None => href.to_string(),
        }
    }

    fn show(&mut self, url: String, html: String) {
        self.url = Some(url);
        self.html = html;
        self.typed.clear();
        self.script.with(|s| s.hidden.clear());
    }
}

#[async_trait]
impl Driver for ScriptedDriver {
    async fn navigate(&mut self, url: &str) -> Result<u16, SessionError> {
        self.alive()?;
        let url = self.resolve(url);
        let (failure, page) = self.script.with(|s| {
            s.navigations.push(url.clone());
            let failure = match s.nav_failures.front() {
                Some((pattern, _)) if url.contains(pattern.as_str()) => {
                    s.nav_failures.pop_front().map(|(_, kind)| kind)
                }
                _ => None,
            };
            if let Some((_, clicks)) = s.challenges_on.iter().find(|(p, _)| url.contains(p.as_str())) {
                s.challenge_remaining = *clicks;
            }
            (failure, s.pages.get(&url).cloned())
        });
        if let Some(kind) = failure {
            if kind == SessionErrorKind::Crashed {
                self.dead = true;
            }
            return Err(SessionError::new(kind, format!("scripted failure for {}", url)));
        }
        match page {
            Some(html) => {
                self.show(url, html);
                Ok(200)
            }
            None => {
                self.show(url.clone(), String::new());
                Err(SessionError::new(SessionErrorKind::Rejected, format!("HTTP 404 for {}", url)))
            }
        }
    }

    async fn title(&mut self) -> Result<String, SessionError> {
        self.alive()?;
        let challenged = self.script.with(|s| {
            s.title_checks += 1;
            s.challenge_remaining > 0
        });
        if challenged {
            Ok("Just a moment...".into())
        } else {
            Ok(dom::title(&self.html))
        }
    }

    async fn current_url(&mut self) -> Result<String, SessionError> {
        self.alive()?;
        self.url
            .clone()
            .ok_or_else(|| SessionError::not_found("no page loaded"))
    }

    async fn page_source(&mut self) -> Result<String, SessionError> {
        self.alive()?;
        Ok(self.html.clone())
    }

    async fn find_all(&mut self, selector: &str) -> Result<Vec<Element>, SessionError> {
        self.alive()?;
        if self.script.with(|s| s.hidden.contains(selector)) {
            return Ok(Vec::new());
        }
        dom::select(&self.html, selector)
    }

    async fn find_within(
        &mut self,
        parent: &Element,
        selector: &str,
    ) -> Result<Vec<Element>, SessionError> {
        self.alive()?;
        dom::select_within(&self.html, parent, selector)
    }

    async fn click(&mut self, element: &Element) -> Result<(), SessionError> {
        self.alive()?;
        let (failure, handler) = self.script.with(|s| {
            s.clicks += 1;
            if s.modal_clears {
                s.hidden.insert(element.selector().to_string());
            }
            (s.click_failure, s.form_handler.clone())
        });
        if let Some(kind) = failure {
            return Err(SessionError::new(kind, "scripted click failure"));
        }
        if let Some(href) = element.href() {
            if !href.starts_with('#') && !href.starts_with("javascript:") {
                return self.navigate(href).await.map(|_| ());
            }
        }
        if let (Some(form), Some(handler)) = (
            dom::submission_for(&self.html, element, &self.typed),
            handler,
        ) {
            let html = handler(&form);
            let url = self.resolve(&form.action);
            self.show(url, html);
        }
        Ok(())
    }

    async fn type_text(&mut self, element: &Element, text: &str) -> Result<(), SessionError> {
        self.alive()?;
        if let Some(name) = element.attr("name") {
            self.typed.insert(name.to_string(), text.to_string());
        }
        Ok(())
    }

    async fn clear_challenge(&mut self) -> Result<(), SessionError> {
        self.alive()?;
        self.script.with(|s| {
            s.challenge_clicks += 1;
            if s.challenge_remaining != STUCK && s.challenge_remaining > 0 {
                s.challenge_remaining -= 1;
            }
        });
        Ok(())
    }
}

pub struct ScriptedFactory {
    pub script: Script,
}

impl DriverFactory for ScriptedFactory {
    fn create(&self, _options: &SessionOptions) -> Result<Box<dyn Driver>, SessionError> {
        self.script.with(|s| s.creations += 1);
        Ok(Box::new(ScriptedDriver::new(self.script.clone())))
    }
}
