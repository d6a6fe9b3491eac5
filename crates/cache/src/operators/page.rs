//! Windowing over sorted streams.
//!
//! `page` and `virtualise` expose a slice of the sorted sequence. Each
//! upstream batch or window request re-derives the slice and reports the
//! difference against the previous one: items leaving the window are
//! removed, items entering it are added and items staying in it are updated
//! or refreshed.

use super::sort::SortedChangeSet;
use super::{Driver, Emission, Operator};
use hashbrown::{HashMap, HashSet};
use keyflux_core::{CacheItem, CacheKey, Change, ChangeReason, ChangeSet, Error, Result};
use keyflux_reactive::{Observable, Subscription};
use std::sync::Arc;

/// A 1-based page of fixed size.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PageRequest {
    page: usize,
    size: usize,
}

impl PageRequest {
    /// Creates a request. Both `page` and `size` must be at least 1.
    pub fn new(page: usize, size: usize) -> Result<Self> {
        if page == 0 {
            return Err(Error::invalid_argument("page numbers start at 1"));
        }
        if size == 0 {
            return Err(Error::invalid_argument("page size must be greater than zero"));
        }
        Ok(Self { page, size })
    }

    pub fn page(&self) -> usize {
        self.page
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

/// Where a page landed after clamping to the available data.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PageResponse {
    pub page: usize,
    pub page_size: usize,
    pub pages: usize,
    pub total_size: usize,
}

/// A window starting at an index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VirtualRequest {
    start_index: usize,
    size: usize,
}

impl VirtualRequest {
    /// Creates a request. `size` must be at least 1.
    pub fn new(start_index: usize, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::invalid_argument("window size must be greater than zero"));
        }
        Ok(Self { start_index, size })
    }

    pub fn start_index(&self) -> usize {
        self.start_index
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VirtualResponse {
    pub start_index: usize,
    pub size: usize,
    pub total_size: usize,
}

/// Window changes plus the page they describe.
#[derive(Clone, Debug)]
pub struct PagedChangeSet<T, K> {
    pub changes: ChangeSet<T, K>,
    pub response: PageResponse,
}

/// Window changes plus the virtual window they describe.
#[derive(Clone, Debug)]
pub struct VirtualChangeSet<T, K> {
    pub changes: ChangeSet<T, K>,
    pub response: VirtualResponse,
}

/// The items currently inside a window.
pub(crate) struct WindowState<T, K> {
    sorted: Arc<Vec<(K, T)>>,
    window: Vec<(K, T)>,
}

impl<T, K> WindowState<T, K>
where
    T: CacheItem,
    K: CacheKey,
{
    pub(crate) fn new() -> Self {
        Self {
            sorted: Arc::new(Vec::new()),
            window: Vec::new(),
        }
    }

    pub(crate) fn total(&self) -> usize {
        self.sorted.len()
    }

    /// Records the sorted sequence after an upstream batch and collects the
    /// keys whose value changed or was refreshed in it.
    pub(crate) fn track(&mut self, sorted: &SortedChangeSet<T, K>, touched: &mut HashMap<K, ChangeReason>) {
        self.sorted = sorted.sorted().clone();
        for change in sorted.changes() {
            match change.reason() {
                ChangeReason::Update => {
                    touched.insert(change.key().clone(), ChangeReason::Update);
                }
                ChangeReason::Refresh => {
                    touched.entry(change.key().clone()).or_insert(ChangeReason::Refresh);
                }
                _ => {}
            }
        }
    }

    /// Moves the window to `start..start + size` and reports the difference.
    pub(crate) fn slide(&mut self, start: usize, size: usize, touched: &HashMap<K, ChangeReason>) -> ChangeSet<T, K> {
        let start = start.min(self.sorted.len());
        let end = start.saturating_add(size).min(self.sorted.len());
        let next: Vec<(K, T)> = self.sorted[start..end].to_vec();

        let changes = {
            let previous: HashMap<&K, (usize, &T)> = self
                .window
                .iter()
                .enumerate()
                .map(|(index, (key, item))| (key, (index, item)))
                .collect();
            let entering: HashSet<&K> = next.iter().map(|(key, _)| key).collect();

            let mut changes = ChangeSet::new();
            for (key, item) in &self.window {
                if !entering.contains(key) {
                    changes.push(Change::remove(key.clone(), item.clone()));
                }
            }
            for (index, (key, item)) in next.iter().enumerate() {
                match previous.get(key) {
                    None => changes.push(Change::add_at(key.clone(), item.clone(), index)),
                    Some(&(old_index, old_item)) => match touched.get(key) {
                        Some(ChangeReason::Update) => {
                            changes.push(Change::update_at(key.clone(), item.clone(), old_item.clone(), index, old_index))
                        }
                        Some(_) => changes.push(Change::refresh_at(key.clone(), item.clone(), index)),
                        None if old_index != index => changes.push(Change::refresh_at(key.clone(), item.clone(), index)),
                        None => {}
                    },
                }
            }
            changes
        };
        self.window = next;
        changes
    }
}

/// Maps a request onto a window over `total` items.
trait Window: Copy + Send + 'static {
    type Response: Send + 'static;

    fn bounds(&self, total: usize) -> (usize, usize);

    fn response(&self, total: usize) -> Self::Response;
}

impl Window for PageRequest {
    type Response = PageResponse;

    fn bounds(&self, total: usize) -> (usize, usize) {
        let page = self.response(total).page;
        ((page - 1) * self.size, self.size)
    }

    fn response(&self, total: usize) -> PageResponse {
        let pages = total.div_ceil(self.size).max(1);
        PageResponse {
            page: self.page.min(pages),
            page_size: self.size,
            pages,
            total_size: total,
        }
    }
}

impl Window for VirtualRequest {
    type Response = VirtualResponse;

    fn bounds(&self, _total: usize) -> (usize, usize) {
        (self.start_index, self.size)
    }

    fn response(&self, total: usize) -> VirtualResponse {
        VirtualResponse {
            start_index: self.start_index,
            size: self.size,
            total_size: total,
        }
    }
}

enum WindowEvent<T, K, R> {
    Data(SortedChangeSet<T, K>),
    Request(R),
    DataCompleted,
    Ignored,
}

struct WindowOperator<T, K, R, O> {
    state: WindowState<T, K>,
    request: Option<R>,
    touched: HashMap<K, ChangeReason>,
    pending: ChangeSet<T, K>,
    dirty: bool,
    done: bool,
    wrap: fn(ChangeSet<T, K>, R, usize) -> O,
}

impl<T, K, R, O> Operator for WindowOperator<T, K, R, O>
where
    T: CacheItem,
    K: CacheKey,
    R: Window,
    O: Send + 'static,
{
    type Event = WindowEvent<T, K, R>;
    type Output = O;

    fn apply(&mut self, event: Self::Event) -> Result<()> {
        match event {
            WindowEvent::Data(sorted) => self.state.track(&sorted, &mut self.touched),
            WindowEvent::Request(request) => {
                self.request = Some(request);
                self.dirty = true;
            }
            WindowEvent::DataCompleted => {
                self.done = true;
                return Ok(());
            }
            WindowEvent::Ignored => return Ok(()),
        }
        if let Some(request) = self.request {
            let (start, size) = request.bounds(self.state.total());
            let changes = self.state.slide(start, size, &self.touched);
            self.pending.merge(changes);
        }
        self.touched.clear();
        Ok(())
    }

    fn flush(&mut self) -> Emission<O> {
        let Some(request) = self.request else {
            return Emission::none();
        };
        let changes = std::mem::take(&mut self.pending);
        let dirty = std::mem::take(&mut self.dirty);
        if changes.is_empty() && !dirty {
            return Emission::none();
        }
        Emission::output(Some((self.wrap)(changes, request, self.state.total())))
    }

    fn is_completed(&self) -> bool {
        self.done
    }
}

fn build<T, K, R, O>(
    source: &Observable<SortedChangeSet<T, K>>,
    requests: Observable<R>,
    wrap: fn(ChangeSet<T, K>, R, usize) -> O,
) -> Observable<O>
where
    T: CacheItem,
    K: CacheKey,
    R: Window,
    O: Send + 'static,
{
    let source = source.clone();
    Observable::create(move |subscriber| {
        let operator = WindowOperator {
            state: WindowState::new(),
            request: None,
            touched: HashMap::new(),
            pending: ChangeSet::new(),
            dirty: false,
            done: false,
            wrap,
        };
        let driver = Driver::new(operator, subscriber);
        Subscription::composite([
            driver.subscribe_input(&requests, WindowEvent::Request, || WindowEvent::Ignored),
            driver.subscribe_input(&source, WindowEvent::Data, || WindowEvent::DataCompleted),
        ])
    })
}

/// Exposes one page of a sorted stream.
///
/// Nothing is emitted before the first request. A page past the end is
/// clamped to the last page.
pub fn page<T, K>(
    source: &Observable<SortedChangeSet<T, K>>,
    requests: &Observable<PageRequest>,
) -> Observable<PagedChangeSet<T, K>>
where
    T: CacheItem,
    K: CacheKey,
{
    build(source, requests.clone(), |changes, request: PageRequest, total| PagedChangeSet {
        changes,
        response: request.response(total),
    })
}

/// Exposes a window of a sorted stream starting at an index.
pub fn virtualise<T, K>(
    source: &Observable<SortedChangeSet<T, K>>,
    requests: &Observable<VirtualRequest>,
) -> Observable<VirtualChangeSet<T, K>>
where
    T: CacheItem,
    K: CacheKey,
{
    build(source, requests.clone(), |changes, request: VirtualRequest, total| VirtualChangeSet {
        changes,
        response: request.response(total),
    })
}

/// Exposes the first `size` items of a sorted stream.
pub fn top<T, K>(source: &Observable<SortedChangeSet<T, K>>, size: usize) -> Result<Observable<VirtualChangeSet<T, K>>>
where
    T: CacheItem,
    K: CacheKey,
{
    let request = VirtualRequest::new(0, size)?;
    Ok(virtualise(source, &Observable::just(request)))
}
