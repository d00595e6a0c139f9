use scraper::{ElementRef, Html, Selector};
use url::Url;

use crate::engine::task::{ScrapeMethod, ScrapeRecord};
use crate::error::ExecutionError;
use crate::fetch::xpath;

/// Compile the selector of a task into a CSS selector
pub fn compile_selector(selector: &str, method: ScrapeMethod) -> Result<Selector, ExecutionError> {
    let css = match method {
        ScrapeMethod::Css => selector.to_string(),
        ScrapeMethod::XPath => xpath::to_css(selector)?,
    };

    Selector::parse(&css).map_err(|e| ExecutionError::InvalidSelector {
        selector: selector.to_string(),
        reason: e.to_string(),
    })
}

/// Extract one record per element matching `selector`.
///
/// Links are resolved against `base_url`. Elements with neither text,
/// link nor description are skipped.
pub fn extract_records(html: &str, selector: &Selector, base_url: Option<&Url>) -> Vec<ScrapeRecord> {
    let document = Html::parse_document(html);
    // Compiled once and used for elements other than anchors
    let anchor = Selector::parse("a[href]").ok();

    document
        .select(selector)
        .filter_map(|element| {
            let record = ScrapeRecord {
                title: element_text(&element),
                link: element_link(&element, anchor.as_ref(), base_url),
                description: element
                    .value()
                    .attr("title")
                    .or_else(|| element.value().attr("alt"))
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty()),
            };

            if record.title.is_none() && record.link.is_none() && record.description.is_none() {
                None
            } else {
                Some(record)
            }
        })
        .collect()
}

fn element_text(element: &ElementRef<'_>) -> Option<String> {
    let text = element
        .text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ");
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

fn element_link(element: &ElementRef<'_>, anchor: Option<&Selector>, base_url: Option<&Url>) -> Option<String> {
    let href = if element.value().name() == "a" {
        element.value().attr("href")
    } else {
        anchor
            .and_then(|anchor| element.select(anchor).next())
            .and_then(|a| a.value().attr("href"))
    }?;

    let href = href.trim();
    if href.is_empty() {
        return None;
    }

    match Url::parse(href) {
        Ok(absolute) => Some(absolute.to_string()),
        Err(_) => match base_url {
            Some(base) => base.join(href).ok().map(|u| u.to_string()),
            None => Some(href.to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
        <html><body>
            <h1>Daily   News</h1>
            <ul id="menu">
                <li><a href="/about">About us</a></li>
                <li><a href="https://other.example/contact" title="Write to us">Contact</a></li>
                <li><a href="">   </a></li>
            </ul>
            <div class="post"><h2>First post</h2><a href="posts/1">read</a></div>
            <img src="logo.png" alt="Logo">
        </body></html>
    "#;

    #[test]
    fn test_css_extraction_resolves_links() {
        let base = Url::parse("https://news.example/index.html").unwrap();
        let selector = compile_selector("#menu a", ScrapeMethod::Css).unwrap();
        let records = extract_records(PAGE, &selector, Some(&base));

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].title.as_deref(), Some("About us"));
        assert_eq!(records[0].link.as_deref(), Some("https://news.example/about"));
        assert_eq!(records[1].link.as_deref(), Some("https://other.example/contact"));
        assert_eq!(records[1].description.as_deref(), Some("Write to us"));
    }

    #[test]
    fn test_container_uses_first_link() {
        let base = Url::parse("https://news.example/").unwrap();
        let selector = compile_selector("div.post", ScrapeMethod::Css).unwrap();
        let records = extract_records(PAGE, &selector, Some(&base));

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].title.as_deref(), Some("First post read"));
        assert_eq!(records[0].link.as_deref(), Some("https://news.example/posts/1"));
    }

    #[test]
    fn test_text_is_normalized_and_alt_is_description() {
        let selector = compile_selector("h1, img", ScrapeMethod::Css).unwrap();
        let records = extract_records(PAGE, &selector, None);
        assert_eq!(records[0].title.as_deref(), Some("Daily News"));
        assert_eq!(records[1].description.as_deref(), Some("Logo"));
    }

    #[test]
    fn test_xpath_extraction() {
        let selector = compile_selector("//ul[@id='menu']/li/a", ScrapeMethod::XPath).unwrap();
        let records = extract_records(PAGE, &selector, None);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].link.as_deref(), Some("/about"));
    }

    #[test]
    fn test_invalid_selectors() {
        assert!(matches!(
            compile_selector("a[", ScrapeMethod::Css),
            Err(ExecutionError::InvalidSelector { .. })
        ));
        assert!(matches!(
            compile_selector("a", ScrapeMethod::XPath),
            Err(ExecutionError::InvalidSelector { .. })
        ));
    }
}
