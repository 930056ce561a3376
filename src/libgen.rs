use crate::error::AppError;
use async_trait::async_trait;
use scraper::{ElementRef, Html, Selector};
use std::{collections::HashSet, time::Duration};
use tracing::{debug, info, instrument, warn};
use url::Url;

pub const MIN_QUERY_CHARS: usize = 3;
const RESULTS_PER_REQUEST: &str = "100";
const PAGE_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Book {
    pub id: String,
    pub title: String,
    pub author: String,
    pub publisher: String,
    pub year: String,
    pub pages: String,
    pub language: String,
    pub size: String,
    pub extension: String,
    pub mirrors: Vec<String>,
    pub download_link: Option<String>,
}

#[async_trait]
pub trait BookSearch: Send + Sync {
    async fn search(&self, query: &str) -> Result<Vec<Book>, AppError>;

    /// Direct link for the file, or `None` when no mirror offers one.
    async fn resolve_download(&self, book: &Book) -> Result<Option<String>, AppError>;
}

pub struct LibgenClient {
    http: reqwest::Client,
    mirrors: Vec<String>,
}

impl LibgenClient {
    pub fn new(http: reqwest::Client, mirrors: Vec<String>) -> Self {
        Self { http, mirrors }
    }

    async fn search_mirror(&self, mirror: &str, query: &str) -> Result<Vec<Book>, AppError> {
        let title_hits = self.search_column(mirror, query, "title").await?;
        let default_hits = match self.search_column(mirror, query, "def").await {
            Ok(hits) => hits,
            Err(err) => {
                warn!(event = "libgen_default_search_failed", mirror, error = %err);
                Vec::new()
            }
        };
        Ok(merge_unique(title_hits, default_hits))
    }

    async fn search_column(&self, mirror: &str, query: &str, column: &str) -> Result<Vec<Book>, AppError> {
        let url = Url::parse_with_params(
            &format!("{mirror}/search.php"),
            &[
                ("req", query),
                ("res", RESULTS_PER_REQUEST),
                ("view", "simple"),
                ("phrase", "1"),
                ("column", column),
            ],
        )
        .map_err(|e| AppError::Scrape(format!("bad mirror url {mirror}: {e}")))?;

        let body = self.fetch_html(url).await?;
        let books = parse_search_page(&body);
        debug!(event = "libgen_column_parsed", mirror, column, count = books.len());
        Ok(books)
    }

    async fn fetch_html(&self, url: Url) -> Result<String, AppError> {
        let response = self.http.get(url.clone()).timeout(PAGE_TIMEOUT).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(AppError::Scrape(format!("{url} answered {status}")));
        }
        Ok(response.text().await?)
    }
}

#[async_trait]
impl BookSearch for LibgenClient {
    #[instrument(skip(self))]
    async fn search(&self, query: &str) -> Result<Vec<Book>, AppError> {
        let mut last_error = None;
        for mirror in &self.mirrors {
            match self.search_mirror(mirror, query).await {
                Ok(books) => {
                    info!(event = "libgen_search_success", mirror = %mirror, count = books.len());
                    return Ok(books);
                }
                Err(err) => {
                    warn!(event = "libgen_search_failed", mirror = %mirror, error = %err);
                    last_error = Some(err);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| AppError::Scrape("no mirrors configured".into())))
    }

    #[instrument(skip(self, book), fields(book_id = %book.id))]
    async fn resolve_download(&self, book: &Book) -> Result<Option<String>, AppError> {
        if let Some(link) = &book.download_link {
            return Ok(Some(link.clone()));
        }
        for mirror in &book.mirrors {
            let Ok(page_url) = Url::parse(mirror) else {
                continue;
            };
            match self.fetch_html(page_url.clone()).await {
                Ok(body) => {
                    if let Some(link) = parse_mirror_page(&body, &page_url) {
                        info!(event = "libgen_link_resolved", mirror = %page_url);
                        return Ok(Some(link));
                    }
                    debug!(event = "libgen_mirror_without_link", mirror = %page_url);
                }
                Err(err) => warn!(event = "libgen_mirror_failed", mirror = %page_url, error = %err),
            }
        }
        Ok(None)
    }
}

/// Concatenates result lists, keeping the first occurrence of every id.
pub fn merge_unique(first: Vec<Book>, second: Vec<Book>) -> Vec<Book> {
    let mut seen = HashSet::new();
    first
        .into_iter()
        .chain(second)
        .filter(|book| seen.insert(book.id.clone()))
        .collect()
}

fn selector(css: &str) -> Selector {
    Selector::parse(css).expect("static selector must parse")
}

/// Rows of the `table.c` result grid on `search.php`.
pub fn parse_search_page(html: &str) -> Vec<Book> {
    let document = Html::parse_document(html);
    let rows = selector("table.c tr");
    let cells = selector("td");
    let anchors = selector("a");

    let mut books = Vec::new();
    for row in document.select(&rows).skip(1) {
        let tds: Vec<ElementRef> = row.select(&cells).collect();
        if tds.len() < 9 {
            continue;
        }
        let id = cell_text(&tds[0]);
        if id.is_empty() || !id.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        let mirrors = tds[9..]
            .iter()
            .flat_map(|td| td.select(&anchors))
            .filter_map(|a| a.value().attr("href"))
            .map(str::to_string)
            .collect();

        books.push(Book {
            id,
            author: cell_text(&tds[1]),
            title: title_text(&tds[2], &anchors),
            publisher: cell_text(&tds[3]),
            year: cell_text(&tds[4]),
            pages: cell_text(&tds[5]),
            language: cell_text(&tds[6]),
            size: cell_text(&tds[7]),
            extension: cell_text(&tds[8]),
            mirrors,
            download_link: None,
        });
    }
    books
}

fn cell_text(cell: &ElementRef) -> String {
    cell.text().collect::<Vec<_>>().join(" ").split_whitespace().collect::<Vec<_>>().join(" ")
}

// The title anchor carries the book id and nests ISBN/edition markup we skip.
fn title_text(cell: &ElementRef, anchors: &Selector) -> String {
    let titled = cell
        .select(anchors)
        .find(|a| a.value().attr("id").is_some())
        .map(|a| {
            a.children()
                .filter_map(|node| node.value().as_text().map(|t| (**t).to_string()))
                .collect::<Vec<_>>()
                .join(" ")
        })
        .map(|t| t.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|t| !t.is_empty());
    titled.unwrap_or_else(|| cell_text(cell))
}

/// Picks the `GET` link from a mirror's download page.
pub fn parse_mirror_page(html: &str, page_url: &Url) -> Option<String> {
    let document = Html::parse_document(html);
    let preferred = selector("#download h2 a");
    let fallback = selector("#download a");
    let href = document
        .select(&preferred)
        .chain(document.select(&fallback))
        .find_map(|a| a.value().attr("href"))?;
    page_url.join(href).ok().map(|url| url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEARCH_PAGE: &str = r#"
<html><body>
<table width=100% class=c>
<tr><td><b>ID</b></td><td>Author(s)</td><td>Title</td><td>Publisher</td><td>Year</td><td>Pages</td><td>Language</td><td>Size</td><td>Extension</td><td>Mirrors</td></tr>
<tr valign=top>
  <td>1421</td>
  <td><a href='search.php?req=Steve+Klabnik'>Steve Klabnik</a>, <a href='search.php?req=Carol+Nichols'>Carol Nichols</a></td>
  <td width=500><a href='search.php?column=series'>[Series]</a><a href='book/index.php?md5=AAA' id=1421>The Rust Programming Language<br><font face=Times color=green><i>9781718500440</i></font></a></td>
  <td>No Starch Press</td><td nowrap>2019</td><td>560</td><td>English</td><td nowrap>6 Mb</td><td nowrap>epub</td>
  <td><a href='http://library.lol/main/AAA'>[1]</a></td>
  <td><a href='http://libgen.li/ads.php?md5=AAA'>[2]</a></td>
</tr>
<tr valign=top>
  <td>9001</td><td>Jim Blandy</td>
  <td><a href='book/index.php?md5=BBB' id=9001>Programming Rust</a></td>
  <td>O'Reilly</td><td>2021</td><td>735</td><td>English</td><td>12 Mb</td><td>pdf</td>
  <td><a href='http://library.lol/main/BBB'>[1]</a></td>
</tr>
<tr><td colspan=3>footer</td></tr>
</table>
</body></html>"#;

    #[test]
    fn parses_result_rows() {
        let books = parse_search_page(SEARCH_PAGE);
        assert_eq!(books.len(), 2);

        let first = &books[0];
        assert_eq!(first.id, "1421");
        assert_eq!(first.title, "The Rust Programming Language");
        assert_eq!(first.author, "Steve Klabnik , Carol Nichols");
        assert_eq!(first.year, "2019");
        assert_eq!(first.size, "6 Mb");
        assert_eq!(first.extension, "epub");
        assert_eq!(
            first.mirrors,
            vec!["http://library.lol/main/AAA", "http://libgen.li/ads.php?md5=AAA"]
        );
        assert!(first.download_link.is_none());

        assert_eq!(books[1].title, "Programming Rust");
        assert_eq!(books[1].publisher, "O'Reilly");
    }

    #[test]
    fn page_without_table_has_no_results() {
        assert!(parse_search_page("<html><body>No files were found</body></html>").is_empty());
    }

    #[test]
    fn merge_keeps_first_occurrence_order() {
        let book = |id: &str, title: &str| Book {
            id: id.into(),
            title: title.into(),
            ..Book::default()
        };
        let merged = merge_unique(
            vec![book("1", "a"), book("2", "b")],
            vec![book("2", "dup"), book("3", "c")],
        );
        let ids: Vec<_> = merged.iter().map(|b| b.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
        assert_eq!(merged[1].title, "b");
    }

    #[test]
    fn mirror_page_yields_absolute_get_link() {
        let page = Url::parse("http://library.lol/main/AAA").unwrap();
        let html = r#"<div id="download"><h2><a href="https://download.library.lol/main/1/AAA/Rust.epub">GET</a></h2>
            <ul><li><a href="https://ipfs.io/x">IPFS</a></li></ul></div>"#;
        assert_eq!(
            parse_mirror_page(html, &page).as_deref(),
            Some("https://download.library.lol/main/1/AAA/Rust.epub")
        );

        let relative = r#"<div id="download"><ul><li><a href="/get/AAA">mirror</a></li></ul></div>"#;
        assert_eq!(
            parse_mirror_page(relative, &page).as_deref(),
            Some("http://library.lol/get/AAA")
        );

        assert!(parse_mirror_page("<p>nothing</p>", &page).is_none());
    }
}
