use glob_match::glob_match;
use klaxon_store::Store;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Trie over dot-separated metric name segments.
///
/// Literal segments go through a child map; segments carrying glob
/// metacharacters are matched one by one. Depth is exact: a pattern with
/// three segments only ever matches three-segment names. Matching is
/// case-sensitive.
pub struct PatternIndex {
    root: Node,
    pattern_count: usize,
}

#[derive(Default)]
struct Node {
    children: HashMap<String, Node>,
    wildcard_children: Vec<(String, Node)>,
    terminal: Vec<String>,
}

fn is_wildcard_segment(segment: &str) -> bool {
    segment.contains(['*', '?', '[', '{'])
}

impl Node {
    fn child_mut(&mut self, segment: &str) -> &mut Node {
        if is_wildcard_segment(segment) {
            if let Some(position) = self
                .wildcard_children
                .iter()
                .position(|(existing, _)| existing == segment)
            {
                return &mut self.wildcard_children[position].1;
            }
            self.wildcard_children
                .push((segment.to_string(), Node::default()));
            &mut self.wildcard_children.last_mut().unwrap().1
        } else {
            self.children.entry(segment.to_string()).or_default()
        }
    }

    fn collect<'a>(&'a self, segments: &[&str], out: &mut Vec<&'a str>) {
        let Some((segment, rest)) = segments.split_first() else {
            out.extend(self.terminal.iter().map(String::as_str));
            return;
        };
        if let Some(child) = self.children.get(*segment) {
            child.collect(rest, out);
        }
        for (glob, child) in &self.wildcard_children {
            if glob_match(glob, segment) {
                child.collect(rest, out);
            }
        }
    }
}

impl PatternIndex {
    pub fn empty() -> Self {
        Self {
            root: Node::default(),
            pattern_count: 0,
        }
    }

    /// Builds the trie from the full pattern set. Cost is linear in the
    /// total segment count.
    pub fn build<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut root = Node::default();
        let mut pattern_count = 0;
        for pattern in patterns {
            let pattern = pattern.as_ref();
            if pattern.is_empty() {
                continue;
            }
            let mut node = &mut root;
            for segment in pattern.split('.') {
                node = node.child_mut(segment);
            }
            if !node.terminal.iter().any(|existing| existing == pattern) {
                node.terminal.push(pattern.to_string());
                pattern_count += 1;
            }
        }
        Self {
            root,
            pattern_count,
        }
    }

    /// Every pattern matching `name`. Empty for no match.
    pub fn match_name(&self, name: &str) -> Vec<String> {
        if name.is_empty() {
            return Vec::new();
        }
        let segments: Vec<&str> = name.split('.').collect();
        let mut out = Vec::new();
        self.root.collect(&segments, &mut out);
        out.into_iter().map(str::to_string).collect()
    }

    pub fn len(&self) -> usize {
        self.pattern_count
    }

    pub fn is_empty(&self) -> bool {
        self.pattern_count == 0
    }
}

/// Shared handle to the current index snapshot. Readers take a cheap clone
/// of the inner `Arc` and never observe a partially built trie.
pub struct IndexHandle {
    current: RwLock<Arc<PatternIndex>>,
}

impl IndexHandle {
    pub fn new(index: PatternIndex) -> Self {
        Self {
            current: RwLock::new(Arc::new(index)),
        }
    }

    pub fn current(&self) -> Arc<PatternIndex> {
        self.current.read().clone()
    }

    pub fn swap(&self, index: PatternIndex) {
        *self.current.write() = Arc::new(index);
    }
}

/// Periodically reloads the pattern set from the store and swaps the index
/// snapshot.
pub struct IndexRefresher {
    store: Arc<dyn Store>,
    handle: Arc<IndexHandle>,
    interval: Duration,
}

impl IndexRefresher {
    pub fn new(store: Arc<dyn Store>, handle: Arc<IndexHandle>, interval: Duration) -> Self {
        // Refresh cadence floor: 1 s.
        Self {
            store,
            handle,
            interval: interval.max(Duration::from_secs(1)),
        }
    }

    /// One reload + swap. Split out of the loop so startup can prime the
    /// index before the listeners accept traffic.
    pub async fn refresh(&self) -> bool {
        match self.store.get_patterns().await {
            Ok(patterns) => {
                let index = PatternIndex::build(&patterns);
                tracing::debug!(patterns = index.len(), "Pattern index rebuilt");
                self.handle.swap(index);
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to reload patterns, keeping previous index");
                false
            }
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut tick = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.refresh().await;
                }
                _ = shutdown.cancelled() => {
                    tracing::info!("Pattern index refresher stopped");
                    return;
                }
            }
        }
    }
}
