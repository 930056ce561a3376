use crate::libgen::Book;
use dashmap::DashMap;
use rand::{distributions::Alphanumeric, Rng};
use std::{
    fmt,
    ops::Range,
    sync::Arc,
    time::{Duration, Instant},
};
use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup};

pub const PAGE_SIZE: usize = 10;
const BUTTON_TITLE_CHARS: usize = 35;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SessionKey(String);

impl SessionKey {
    pub fn new() -> Self {
        let value: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(10)
            .map(char::from)
            .collect();
        Self(value)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn from_raw(value: impl Into<String>) -> Self {
        Self(value.into())
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug)]
pub struct SearchSession {
    pub results: Vec<Book>,
    pub query: String,
    pub created_at: Instant,
}

impl SearchSession {
    pub fn new(query: String, results: Vec<Book>) -> Self {
        Self {
            results,
            query,
            created_at: Instant::now(),
        }
    }
}

/// Search results keyed by the session key embedded in button payloads.
#[derive(Clone)]
pub struct SessionCache {
    inner: Arc<DashMap<SessionKey, Arc<SearchSession>>>,
    ttl: Option<Duration>,
}

impl SessionCache {
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(DashMap::new()),
            ttl,
        }
    }

    pub fn insert(&self, session: SearchSession) -> (SessionKey, Arc<SearchSession>) {
        let key = SessionKey::new();
        let session = Arc::new(session);
        self.inner.insert(key.clone(), session.clone());
        (key, session)
    }

    /// Looks up a live session; expired entries are dropped on the way out.
    pub fn get(&self, key: &SessionKey, now: Instant) -> Option<Arc<SearchSession>> {
        let session = self.inner.get(key).map(|entry| entry.clone())?;
        if self.is_expired(&session, now) {
            self.inner.remove(key);
            return None;
        }
        Some(session)
    }

    pub fn purge_expired(&self, now: Instant) -> usize {
        let before = self.inner.len();
        self.inner.retain(|_, session| !self.is_expired(&**session, now));
        before.saturating_sub(self.inner.len())
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    fn is_expired(&self, session: &SearchSession, now: Instant) -> bool {
        match self.ttl {
            Some(ttl) => now.saturating_duration_since(session.created_at) >= ttl,
            None => false,
        }
    }
}

pub fn total_pages(total: usize) -> usize {
    (total + PAGE_SIZE - 1) / PAGE_SIZE
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PageWindow {
    pub page: usize,
    pub total_pages: usize,
    pub range: Range<usize>,
}

impl PageWindow {
    /// `page` is 1-based; anything outside `[1, total_pages]` is rejected.
    pub fn new(total: usize, page: usize) -> Option<Self> {
        let total_pages = total_pages(total);
        if page == 0 || page > total_pages {
            return None;
        }
        let start = (page - 1) * PAGE_SIZE;
        let end = (start + PAGE_SIZE).min(total);
        Some(Self {
            page,
            total_pages,
            range: start..end,
        })
    }

    pub fn has_back(&self) -> bool {
        self.page > 1
    }

    pub fn has_next(&self) -> bool {
        self.page < self.total_pages
    }
}

pub fn search_keyboard(results: &[Book], key: &SessionKey, window: &PageWindow) -> InlineKeyboardMarkup {
    let mut rows = Vec::new();
    for index in window.range.clone() {
        let book = &results[index];
        let label = format!(
            "{} ~{} - {}",
            book.extension.to_uppercase(),
            book.size,
            truncate_title(&book.title, BUTTON_TITLE_CHARS)
        );
        rows.push(vec![InlineKeyboardButton::callback(
            label,
            LibraryCallback::Download { key: key.clone(), index }.to_payload(),
        )]);
    }

    let mut nav = Vec::new();
    if window.has_back() {
        nav.push(InlineKeyboardButton::callback(
            "⌫ Back",
            LibraryCallback::Page { key: key.clone(), page: window.page - 1 }.to_payload(),
        ));
    }
    nav.push(InlineKeyboardButton::callback(
        format!("{}/{}", window.page, window.total_pages),
        LibraryCallback::Noop.to_payload(),
    ));
    if window.has_next() {
        nav.push(InlineKeyboardButton::callback(
            "Next ➪",
            LibraryCallback::Page { key: key.clone(), page: window.page + 1 }.to_payload(),
        ));
    }
    rows.push(nav);

    InlineKeyboardMarkup::new(rows)
}

pub fn truncate_title(title: &str, max_chars: usize) -> String {
    if title.chars().count() > max_chars {
        let cut: String = title.chars().take(max_chars).collect();
        format!("{cut}...")
    } else {
        title.to_string()
    }
}

const PAGE_CALLBACK_PREFIX: &str = "lgpage:";
const DOWNLOAD_CALLBACK_PREFIX: &str = "lgdl:";
const NOOP_CALLBACK: &str = "lgnoop";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LibraryCallback {
    Page { key: SessionKey, page: usize },
    Download { key: SessionKey, index: usize },
    Noop,
}

impl LibraryCallback {
    pub fn to_payload(&self) -> String {
        match self {
            Self::Page { key, page } => format!("{PAGE_CALLBACK_PREFIX}{}:{page}", key.as_str()),
            Self::Download { key, index } => format!("{DOWNLOAD_CALLBACK_PREFIX}{}:{index}", key.as_str()),
            Self::Noop => NOOP_CALLBACK.to_string(),
        }
    }

    pub fn parse(data: &str) -> Option<Self> {
        if data == NOOP_CALLBACK {
            return Some(Self::Noop);
        }
        if let Some(payload) = data.strip_prefix(PAGE_CALLBACK_PREFIX) {
            let (key, page) = split_key_number(payload)?;
            return Some(Self::Page { key, page });
        }
        if let Some(payload) = data.strip_prefix(DOWNLOAD_CALLBACK_PREFIX) {
            let (key, index) = split_key_number(payload)?;
            return Some(Self::Download { key, index });
        }
        None
    }
}

fn split_key_number(payload: &str) -> Option<(SessionKey, usize)> {
    let mut parts = payload.splitn(2, ':');
    let key = parts.next()?.trim();
    let number = parts.next()?.trim().parse::<usize>().ok()?;
    if key.is_empty() {
        return None;
    }
    Some((SessionKey::from_raw(key), number))
}

#[cfg(test)]
mod tests {
    use super::*;
    use teloxide::types::InlineKeyboardButtonKind;

    fn books(n: usize) -> Vec<Book> {
        (0..n)
            .map(|i| Book {
                id: i.to_string(),
                title: format!("Book number {i}"),
                extension: "pdf".into(),
                size: "1 Mb".into(),
                ..Book::default()
            })
            .collect()
    }

    fn nav_labels(markup: &InlineKeyboardMarkup) -> Vec<String> {
        markup
            .inline_keyboard
            .last()
            .unwrap()
            .iter()
            .map(|b| b.text.clone())
            .collect()
    }

    #[test]
    fn total_pages_is_ceiling() {
        assert_eq!(total_pages(0), 0);
        assert_eq!(total_pages(1), 1);
        assert_eq!(total_pages(10), 1);
        assert_eq!(total_pages(11), 2);
        assert_eq!(total_pages(95), 10);
    }

    #[test]
    fn page_window_rejects_out_of_range() {
        assert!(PageWindow::new(25, 0).is_none());
        assert!(PageWindow::new(25, 4).is_none());
        assert!(PageWindow::new(0, 1).is_none());
        let last = PageWindow::new(25, 3).unwrap();
        assert_eq!(last.range, 20..25);
    }

    #[test]
    fn boundary_pages_hide_back_and_next() {
        let results = books(25);
        let key = SessionKey::from_raw("abc");

        let first = search_keyboard(&results, &key, &PageWindow::new(25, 1).unwrap());
        assert_eq!(nav_labels(&first), vec!["1/3", "Next ➪"]);
        assert_eq!(first.inline_keyboard.len(), PAGE_SIZE + 1);

        let middle = search_keyboard(&results, &key, &PageWindow::new(25, 2).unwrap());
        assert_eq!(nav_labels(&middle), vec!["⌫ Back", "2/3", "Next ➪"]);

        let last = search_keyboard(&results, &key, &PageWindow::new(25, 3).unwrap());
        assert_eq!(nav_labels(&last), vec!["⌫ Back", "3/3"]);
        assert_eq!(last.inline_keyboard.len(), 5 + 1);
    }

    #[test]
    fn single_page_has_only_indicator() {
        let results = books(3);
        let key = SessionKey::from_raw("abc");
        let markup = search_keyboard(&results, &key, &PageWindow::new(3, 1).unwrap());
        assert_eq!(nav_labels(&markup), vec!["1/1"]);
    }

    #[test]
    fn download_buttons_carry_global_index() {
        let results = books(25);
        let key = SessionKey::from_raw("abc");
        let markup = search_keyboard(&results, &key, &PageWindow::new(25, 2).unwrap());
        let first = &markup.inline_keyboard[0][0];
        match &first.kind {
            InlineKeyboardButtonKind::CallbackData(data) => {
                assert_eq!(
                    LibraryCallback::parse(data),
                    Some(LibraryCallback::Download { key, index: 10 })
                );
            }
            other => panic!("unexpected button kind {other:?}"),
        }
        assert!(first.text.starts_with("PDF ~1 Mb - Book number 10"));
    }

    #[test]
    fn callback_payloads_parse_and_reject_garbage() {
        let key = SessionKey::from_raw("k3y");
        let page = LibraryCallback::Page { key: key.clone(), page: 4 };
        assert_eq!(LibraryCallback::parse(&page.to_payload()), Some(page));
        assert_eq!(LibraryCallback::parse("lgnoop"), Some(LibraryCallback::Noop));
        assert!(LibraryCallback::parse("lgpage:k3y:x").is_none());
        assert!(LibraryCallback::parse("lgdl::3").is_none());
        assert!(LibraryCallback::parse("lgdl:k3y").is_none());
        assert!(LibraryCallback::parse("upload_document").is_none());
    }

    #[test]
    fn payloads_fit_telegram_limit() {
        let key = SessionKey::new();
        let payload = LibraryCallback::Download { key, index: usize::MAX }.to_payload();
        assert!(payload.len() <= 64);
    }

    #[test]
    fn titles_are_truncated_by_chars() {
        assert_eq!(truncate_title("short", 35), "short");
        let long = "ä".repeat(40);
        assert_eq!(truncate_title(&long, 35).chars().count(), 38);
    }

    #[test]
    fn unknown_and_expired_sessions_miss() {
        let cache = SessionCache::new(Some(Duration::from_secs(60)));
        let now = Instant::now();
        assert!(cache.get(&SessionKey::from_raw("nope"), now).is_none());

        let (key, _) = cache.insert(SearchSession::new("rust".into(), books(3)));
        assert!(cache.get(&key, now).is_some());
        assert!(cache.get(&key, now + Duration::from_secs(61)).is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn purge_drops_only_expired_entries() {
        let cache = SessionCache::new(Some(Duration::from_secs(60)));
        let (key, _) = cache.insert(SearchSession::new("old".into(), books(1)));
        let now = Instant::now();
        assert_eq!(cache.purge_expired(now), 0);
        assert_eq!(cache.purge_expired(now + Duration::from_secs(120)), 1);
        assert!(cache.get(&key, now).is_none());
    }

    #[test]
    fn sessions_without_ttl_never_expire() {
        let cache = SessionCache::new(None);
        let (key, _) = cache.insert(SearchSession::new("q".into(), books(1)));
        let far = Instant::now() + Duration::from_secs(86_400 * 365);
        assert!(cache.get(&key, far).is_some());
    }
}
