use std::cell::RefCell;
use std::collections::HashSet;

use readability_js::{Readability, ReadabilityError, ReadabilityOptions};
use url::Url;

/// Chapter text pulled out of a fetched page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapterText {
    pub title: Option<String>,
    pub body: String,
}

thread_local! {
    static READABILITY: RefCell<Option<Readability>> = const { RefCell::new(None) };
}

/// Converts a fetched chapter page into plain chapter text.
///
/// HTML goes through readability first so that site navigation, footers and
/// ads are left behind; pages readability cannot handle are converted whole.
/// Non-HTML input passes through. Blocks on the JS engine, so async callers
/// should run it on a blocking thread.
pub fn chapter_text(fetched: &str, url: &str) -> ChapterText {
    if !looks_like_html(fetched) {
        return split_heading(fetched);
    }

    let (page_title, markdown) =
        match with_readability(|readability| extract_with_readability(readability, fetched, url)) {
            Some(Ok(content)) if !content.body_md.trim().is_empty() => {
                (Some(content.title), content.body_md)
            }
            Some(Ok(_)) => {
                tracing::debug!(url, "readability found no content; converting whole page");
                (None, html2md::parse_html(fetched))
            }
            Some(Err(err)) => {
                tracing::debug!(url, ?err, "readability extraction failed; converting whole page");
                (None, html2md::parse_html(fetched))
            }
            None => (None, html2md::parse_html(fetched)),
        };

    let mut text = split_heading(&markdown);
    if text.title.is_none() {
        text.title = page_title
            .map(|t| t.trim().to_owned())
            .filter(|t| !t.is_empty());
    }
    text
}

#[derive(Debug)]
struct ExtractedContent {
    title: String,
    body_md: String,
}

fn with_readability<T>(f: impl FnOnce(&Readability) -> T) -> Option<T> {
    READABILITY.with(|cell| {
        let mut slot = cell.borrow_mut();
        if slot.is_none() {
            match Readability::new() {
                Ok(readability) => *slot = Some(readability),
                Err(err) => {
                    tracing::warn!(?err, "failed to initialize readability-js");
                    return None;
                }
            }
        }
        slot.as_ref().map(f)
    })
}

fn extract_with_readability(
    readability: &Readability,
    html: &str,
    url: &str,
) -> Result<ExtractedContent, ReadabilityError> {
    match readability.parse_with_url(html, url) {
        Ok(article) => Ok(ExtractedContent {
            title: article.title,
            body_md: html2md::parse_html(&article.content),
        }),
        // Short chapters fail the readerable check; relax the thresholds.
        Err(ReadabilityError::ReadabilityCheckFailed) => {
            let options = ReadabilityOptions::new()
                .char_threshold(0)
                .nb_top_candidates(10)
                .link_density_modifier(2.0);
            let article = readability.parse_with_options(html, Some(url), Some(options))?;
            Ok(ExtractedContent {
                title: article.title,
                body_md: html2md::parse_html(&article.content),
            })
        }
        Err(err) => Err(err),
    }
}

/// Takes a leading markdown heading (ATX or setext) off as the title.
fn split_heading(markdown: &str) -> ChapterText {
    let all: Vec<&str> = markdown.lines().map(str::trim).collect();
    let start = all.iter().position(|l| !l.is_empty()).unwrap_or(all.len());
    let mut title = None;
    let mut rest = start;
    if let Some(first) = all.get(start) {
        if first.starts_with('#') {
            let heading = first.trim_start_matches('#').trim_end_matches('#').trim();
            if !heading.is_empty() {
                title = Some(heading.to_owned());
                rest = start + 1;
            }
        } else if all.get(start + 1).is_some_and(|next| is_setext_underline(next)) {
            title = Some((*first).to_owned());
            rest = start + 2;
        }
    }
    let lines = &all[rest.min(all.len())..];

    ChapterText {
        title,
        body: collapse_blank_lines(&lines.join("\n")),
    }
}

fn looks_like_html(input: &str) -> bool {
    let head = input
        .trim_start()
        .chars()
        .take(512)
        .collect::<String>()
        .to_ascii_lowercase();
    head.starts_with("<!doctype html")
        || head.starts_with("<html")
        || head.contains("<body")
        || (head.starts_with('<') && head.contains("</"))
}

fn is_setext_underline(line: &str) -> bool {
    line.len() >= 3 && (line.chars().all(|c| c == '=') || line.chars().all(|c| c == '-'))
}

fn collapse_blank_lines(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut blank_run = 0usize;
    for line in input.lines() {
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line);
        out.push('\n');
    }
    out.trim_end().to_owned()
}

/// A chapter link found on a book's index page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapterLink {
    pub url: String,
    pub title: String,
}

/// Collects the chapter links of an index page in document order.
///
/// Links are resolved against `index_url` and kept only on the same host. The
/// chapter list is taken to be the directory that holds the most links, which
/// leaves navigation and footer links behind.
pub fn chapter_links(index_html: &str, index_url: &Url) -> Vec<ChapterLink> {
    let markdown = html2md::parse_html(index_html);
    let mut seen = HashSet::new();
    let mut links: Vec<(String, ChapterLink)> = Vec::new();
    for (text, href) in markdown_links(&markdown) {
        let Ok(mut url) = index_url.join(&href) else {
            continue;
        };
        url.set_fragment(None);
        if !matches!(url.scheme(), "http" | "https")
            || url.host_str() != index_url.host_str()
            || url.path() == index_url.path()
            || !seen.insert(url.to_string())
        {
            continue;
        }
        let dir = match url.path().rsplit_once('/') {
            Some((dir, _)) => dir.to_owned(),
            None => String::new(),
        };
        links.push((
            dir,
            ChapterLink {
                url: url.to_string(),
                title: text,
            },
        ));
    }

    let mut counts: Vec<(&str, usize)> = Vec::new();
    for (dir, _) in &links {
        match counts.iter_mut().find(|(d, _)| *d == dir.as_str()) {
            Some((_, n)) => *n += 1,
            None => counts.push((dir.as_str(), 1)),
        }
    }
    // Ties go to the directory seen first.
    let Some(best) = counts
        .iter()
        .fold(None::<(&str, usize)>, |best, &(dir, n)| match best {
            Some((_, m)) if m >= n => best,
            _ => Some((dir, n)),
        })
        .map(|(dir, _)| dir.to_owned())
    else {
        return Vec::new();
    };

    links
        .into_iter()
        .filter(|(dir, _)| *dir == best)
        .map(|(_, link)| link)
        .collect()
}

/// `[text](target)` pairs from html2md output, images excluded.
fn markdown_links(markdown: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let mut rest = markdown;
    while let Some(open) = rest.find('[') {
        let is_image = rest[..open].ends_with('!');
        let after = &rest[open + 1..];
        let Some(close) = after.find("](") else {
            break;
        };
        let tail = &after[close + 2..];
        let Some(end) = tail.find(')') else {
            break;
        };
        let text = after[..close].rsplit('[').next().unwrap_or_default().trim();
        let target = tail[..end].split_whitespace().next().unwrap_or_default();
        if !is_image && !target.is_empty() {
            out.push((text.to_owned(), target.to_owned()));
        }
        rest = &tail[end + 1..];
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const URL: &str = "https://novel.test/book/1.html";

    #[test]
    fn plain_text_passes_through() {
        let text = chapter_text("第一章 开始\n\n他走了。\n\n\n\n她来了。", URL);
        assert_eq!(text.title, None);
        assert_eq!(text.body, "第一章 开始\n\n他走了。\n\n她来了。");
    }

    #[test]
    fn html_heading_becomes_title() {
        let html = "<!doctype html><html><body><h1>第二章</h1><p>正文一</p><p>正文二</p></body></html>";
        let text = chapter_text(html, URL);
        assert_eq!(text.title.as_deref(), Some("第二章"));
        assert!(text.body.contains("正文一"));
        assert!(text.body.contains("正文二"));
        assert!(!text.body.contains('<'));
    }

    #[test]
    fn site_chrome_around_the_chapter_is_dropped() {
        let html = r#"<!doctype html><html><head><title>第一章</title></head><body>
<div class="header"><a href="/">首页</a> <a href="/list">目录</a> 登录 注册</div>
<h1>第一章</h1>
<div id="content">
<p>少年从小镇出发，背着一把旧剑，沿着河岸一路向北走去，天色渐渐暗了下来。</p>
<p>他在渡口停下脚步，看着对岸的灯火，想起了家中的母亲和那间破旧的草屋。</p>
<p>船夫问他要去哪里，他说要去很远的地方，去看一看书里写过的那些山和水。</p>
</div>
<div class="footer">上一章 下一章 本站广告 版权所有</div>
</body></html>"#;
        let text = chapter_text(html, URL);
        assert_eq!(text.title.as_deref(), Some("第一章"));
        assert!(text.body.contains("少年从小镇出发"), "{}", text.body);
        assert!(text.body.contains("去看一看书里写过的那些山和水"), "{}", text.body);
        assert!(!text.body.contains("版权所有"), "{}", text.body);
        assert!(!text.body.contains("登录"), "{}", text.body);
    }

    #[test]
    fn index_links_keep_the_chapter_directory_in_order() {
        let html = r#"<html><body>
<div><a href="/">首页</a> <a href="/top/">排行</a> <a href="/top/week">周榜</a></div>
<ul>
<li><a href="1.html">第一章</a></li>
<li><a href="2.html#c">第二章</a></li>
<li><a href="/book/2.html">第二章</a></li>
<li><a href="3.html">第三章</a></li>
</ul>
<a href="https://elsewhere.test/book/9.html">广告</a>
</body></html>"#;
        let index = Url::parse("https://novel.test/book/").unwrap();
        let links = chapter_links(html, &index);
        let urls: Vec<&str> = links.iter().map(|l| l.url.as_str()).collect();
        assert_eq!(
            urls,
            vec![
                "https://novel.test/book/1.html",
                "https://novel.test/book/2.html",
                "https://novel.test/book/3.html",
            ]
        );
        assert_eq!(links[0].title, "第一章");
    }

    #[test]
    fn images_are_not_links() {
        let links = markdown_links("![cover](/c.jpg) [第一章](1.html) [x] y [第二章](2.html \"t\")");
        assert_eq!(
            links,
            vec![
                ("第一章".to_owned(), "1.html".to_owned()),
                ("第二章".to_owned(), "2.html".to_owned()),
            ]
        );
    }
}
