//! Element snapshots and form handling over a page's HTML.
//!
//! `scraper::Html` is not `Send`, so documents are parsed on demand inside
//! these synchronous helpers and only owned snapshots cross await points.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};

use super::{SessionError, SessionErrorKind};

static POSTBACK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"__doPostBack\('([^']*)','([^']*)'\)").unwrap());

/// Owned snapshot of a DOM element plus the path needed to find it again.
#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    path: Vec<(String, usize)>,
    pub tag: String,
    pub text: String,
    attrs: Vec<(String, String)>,
}

impl Element {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn id(&self) -> Option<&str> {
        self.attr("id")
    }

    pub fn href(&self) -> Option<&str> {
        self.attr("href").filter(|h| !h.trim().is_empty())
    }

    /// Selector this element was first found by.
    pub fn selector(&self) -> &str {
        self.path.first().map(|(s, _)| s.as_str()).unwrap_or("")
    }

    /// ASP.NET `javascript:__doPostBack(target, argument)` link, if this is one.
    pub fn postback(&self) -> Option<(String, String)> {
        let href = self.href()?;
        let caps = POSTBACK_RE.captures(href)?;
        Some((caps[1].to_string(), caps[2].to_string()))
    }

    fn snapshot(el: ElementRef<'_>, path: Vec<(String, usize)>) -> Self {
        Element {
            path,
            tag: el.value().name().to_string(),
            text: normalized_text(el),
            attrs: el
                .value()
                .attrs()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }
}

/// Whitespace-collapsed text content.
pub fn normalized_text(el: ElementRef<'_>) -> String {
    el.text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

fn parse_selector(selector: &str) -> Result<Selector, SessionError> {
    Selector::parse(selector).map_err(|e| {
        SessionError::new(
            SessionErrorKind::Rejected,
            format!("invalid selector {}: {:?}", selector, e),
        )
    })
}

pub fn title(html: &str) -> String {
    let doc = Html::parse_document(html);
    let Ok(sel) = Selector::parse("title") else {
        return String::new();
    };
    doc.select(&sel)
        .next()
        .map(normalized_text)
        .unwrap_or_default()
}

pub fn select(html: &str, selector: &str) -> Result<Vec<Element>, SessionError> {
    let sel = parse_selector(selector)?;
    let doc = Html::parse_document(html);
    Ok(doc
        .select(&sel)
        .enumerate()
        .map(|(i, el)| Element::snapshot(el, vec![(selector.to_string(), i)]))
        .collect())
}

pub fn select_within(
    html: &str,
    parent: &Element,
    selector: &str,
) -> Result<Vec<Element>, SessionError> {
    let sel = parse_selector(selector)?;
    let doc = Html::parse_document(html);
    let root = resolve(&doc, &parent.path)
        .ok_or_else(|| SessionError::not_found(format!("stale element <{}>", parent.tag)))?;
    Ok(root
        .select(&sel)
        .enumerate()
        .map(|(i, el)| {
            let mut path = parent.path.clone();
            path.push((selector.to_string(), i));
            Element::snapshot(el, path)
        })
        .collect())
}

fn resolve<'a>(doc: &'a Html, path: &[(String, usize)]) -> Option<ElementRef<'a>> {
    let ((first_sel, first_idx), rest) = path.split_first()?;
    let sel = Selector::parse(first_sel).ok()?;
    let mut current = doc.select(&sel).nth(*first_idx)?;
    for (sel, idx) in rest {
        let sel = Selector::parse(sel).ok()?;
        current = current.select(&sel).nth(*idx)?;
    }
    Some(current)
}

/// Whether the element still exists in `html`.
pub fn exists(html: &str, element: &Element) -> bool {
    let doc = Html::parse_document(html);
    resolve(&doc, &element.path).is_some()
}

#[derive(Debug, Clone, PartialEq)]
pub struct FormSubmission {
    pub method: String,
    pub action: String,
    pub fields: Vec<(String, String)>,
}

/// Submission produced by clicking `element`, if it is a submit control inside a form.
pub fn submission_for(
    html: &str,
    element: &Element,
    typed: &HashMap<String, String>,
) -> Option<FormSubmission> {
    let doc = Html::parse_document(html);
    let clicked = resolve(&doc, &element.path)?;
    if !is_submit_control(clicked) {
        return None;
    }
    let form = clicked
        .ancestors()
        .filter_map(ElementRef::wrap)
        .find(|a| a.value().name() == "form")?;
    Some(collect_form(form, Some(clicked), typed, &[]))
}

/// Submission for an ASP.NET postback link: the page's first form with the event target set.
pub fn postback_submission(
    html: &str,
    target: &str,
    argument: &str,
    typed: &HashMap<String, String>,
) -> Option<FormSubmission> {
    let doc = Html::parse_document(html);
    let sel = Selector::parse("form").ok()?;
    let form = doc.select(&sel).next()?;
    let overrides = [
        ("__EVENTTARGET".to_string(), target.to_string()),
        ("__EVENTARGUMENT".to_string(), argument.to_string()),
    ];
    Some(collect_form(form, None, typed, &overrides))
}

fn is_submit_control(el: ElementRef<'_>) -> bool {
    let v = el.value();
    let kind = v.attr("type").unwrap_or("").to_lowercase();
    match v.name() {
        "button" => kind != "button" && kind != "reset",
        "input" => kind == "submit" || kind == "image",
        _ => false,
    }
}

fn collect_form(
    form: ElementRef<'_>,
    clicked: Option<ElementRef<'_>>,
    typed: &HashMap<String, String>,
    overrides: &[(String, String)],
) -> FormSubmission {
    let mut fields: Vec<(String, String)> = Vec::new();
    let Ok(controls) = Selector::parse("input[name], select[name], textarea[name], button[name]") else {
        return FormSubmission {
            method: "get".into(),
            action: String::new(),
            fields,
        };
    };

    for control in form.select(&controls) {
        let v = control.value();
        let Some(name) = v.attr("name") else { continue };
        let kind = v.attr("type").unwrap_or("text").to_lowercase();
        let is_clicked = clicked.map(|c| c.id() == control.id()).unwrap_or(false);

        let value = match v.name() {
            "button" => {
                if !is_clicked {
                    continue;
                }
                v.attr("value").unwrap_or("").to_string()
            }
            "select" => {
                let Ok(opt_sel) = Selector::parse("option") else { continue };
                let mut options = control.select(&opt_sel);
                let chosen = control
                    .select(&opt_sel)
                    .find(|o| o.value().attr("selected").is_some())
                    .or_else(|| options.next());
                match chosen {
                    Some(o) => o
                        .value()
                        .attr("value")
                        .map(str::to_string)
                        .unwrap_or_else(|| normalized_text(o)),
                    None => continue,
                }
            }
            "textarea" => control.text().collect::<String>(),
            _ => match kind.as_str() {
                "submit" | "image" | "button" | "reset" => {
                    if !is_clicked {
                        continue;
                    }
                    v.attr("value").unwrap_or("").to_string()
                }
                "checkbox" | "radio" => {
                    if v.attr("checked").is_none() {
                        continue;
                    }
                    v.attr("value").unwrap_or("on").to_string()
                }
                _ => v.attr("value").unwrap_or("").to_string(),
            },
        };

        let value = typed.get(name).cloned().unwrap_or(value);
        fields.push((name.to_string(), value));
    }

    for (name, value) in overrides {
        match fields.iter_mut().find(|(k, _)| k == name) {
            Some(slot) => slot.1 = value.clone(),
            None => fields.push((name.clone(), value.clone())),
        }
    }

    FormSubmission {
        method: form.value().attr("method").unwrap_or("get").to_lowercase(),
        action: form.value().attr("action").unwrap_or("").to_string(),
        fields,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
        <html><head><title> Crawford County  qPublic </title></head><body>
        <form method="POST" action="/Search.aspx">
          <input type="hidden" name="__VIEWSTATE" value="abc">
          <input type="text" name="ctl01$txtOwner" value="">
          <input type="checkbox" name="chkActive" checked>
          <input type="checkbox" name="chkInactive">
          <select name="ddlType"><option value="1">One</option><option value="2" selected>Two</option></select>
          <input type="submit" id="ctlBodyPane_ctl01_btnSearch" name="ctl01$btnSearch" value="Search">
          <input type="submit" name="ctl01$btnClear" value="Clear">
        </form>
        <ul class="state-group"><li class="dropdown-option" id="a">A</li><li class="dropdown-option" id="b">B</li></ul>
        <ul class="state-group"><li class="dropdown-option" id="c">C</li></ul>
        <a id="lnk" href="javascript:__doPostBack('ctl00$lnkNext','')">Next</a>
        </body></html>"#;

    #[test]
    fn title_is_normalized() {
        assert_eq!(title(PAGE), "Crawford County qPublic");
    }

    #[test]
    fn nested_selection_keeps_scope() {
        let groups = select(PAGE, ".state-group").unwrap();
        assert_eq!(groups.len(), 2);
        let second = select_within(PAGE, &groups[1], ".dropdown-option").unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].id(), Some("c"));
        assert!(exists(PAGE, &second[0]));
    }

    #[test]
    fn bad_selector_is_rejected_not_absent() {
        let err = select(PAGE, "[[").unwrap_err();
        assert_eq!(err.kind, SessionErrorKind::Rejected);
    }

    #[test]
    fn submit_collects_form_state() {
        let button = select(PAGE, "[id*='_ctl01_btnSearch']").unwrap().remove(0);
        let mut typed = HashMap::new();
        typed.insert("ctl01$txtOwner".to_string(), "A*".to_string());
        let sub = submission_for(PAGE, &button, &typed).unwrap();
        assert_eq!(sub.method, "post");
        assert_eq!(sub.action, "/Search.aspx");
        let get = |k: &str| sub.fields.iter().find(|(n, _)| n == k).map(|(_, v)| v.as_str());
        assert_eq!(get("__VIEWSTATE"), Some("abc"));
        assert_eq!(get("ctl01$txtOwner"), Some("A*"));
        assert_eq!(get("chkActive"), Some("on"));
        assert_eq!(get("chkInactive"), None);
        assert_eq!(get("ddlType"), Some("2"));
        assert_eq!(get("ctl01$btnSearch"), Some("Search"));
        assert_eq!(get("ctl01$btnClear"), None);
    }

    #[test]
    fn postback_link_targets_first_form() {
        let link = select(PAGE, "#lnk").unwrap().remove(0);
        let (target, arg) = link.postback().unwrap();
        assert_eq!(target, "ctl00$lnkNext");
        let sub = postback_submission(PAGE, &target, &arg, &HashMap::new()).unwrap();
        assert!(sub
            .fields
            .contains(&("__EVENTTARGET".to_string(), "ctl00$lnkNext".to_string())));
    }
}
