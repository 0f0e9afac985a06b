use std::collections::{HashSet, VecDeque};

use rand::distr::Distribution;
use rand::distr::weighted::WeightedIndex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::SlideError;
use crate::slide::SlideId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionMode {
    Single,
    Random,
    Weighted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Reverse,
}

/// One rotation slot choosing among candidate slides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct PlaylistItem {
    #[serde(default)]
    pub position: usize,
    pub mode: SelectionMode,
    #[serde(rename = "slides")]
    pub ids: Vec<SlideId>,
    #[serde(default)]
    pub weights: Vec<u32>,
}

impl PlaylistItem {
    pub fn single(position: usize, id: SlideId) -> Self {
        Self {
            position,
            mode: SelectionMode::Single,
            ids: vec![id],
            weights: Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<(), SlideError> {
        let reason = if self.ids.is_empty() {
            Some("item has no candidate slides".to_string())
        } else if self.mode == SelectionMode::Weighted && self.weights.len() != self.ids.len() {
            Some(format!(
                "weighted item needs one weight per slide ({} slides, {} weights)",
                self.ids.len(),
                self.weights.len()
            ))
        } else {
            None
        };
        match reason {
            Some(reason) => Err(SlideError::InvalidPlaylist {
                position: self.position,
                reason,
            }),
            None => Ok(()),
        }
    }

    /// Ids this item can actually produce; zero-weight candidates are out.
    fn selectable(&self) -> impl Iterator<Item = &SlideId> {
        self.ids.iter().enumerate().filter_map(move |(idx, id)| {
            let excluded = self.mode == SelectionMode::Weighted
                && self.weights.get(idx).copied().unwrap_or(0) == 0;
            (!excluded).then_some(id)
        })
    }

    fn pick(&self, rng: &mut StdRng) -> Option<SlideId> {
        match self.mode {
            SelectionMode::Single => self.ids.first().cloned(),
            SelectionMode::Random => {
                if self.ids.is_empty() {
                    None
                } else {
                    let idx = rng.random_range(0..self.ids.len());
                    self.ids.get(idx).cloned()
                }
            }
            SelectionMode::Weighted => {
                let dist = WeightedIndex::new(self.weights.iter().copied()).ok()?;
                self.ids.get(dist.sample(rng)).cloned()
            }
        }
    }

    fn remove_id(&mut self, id: &SlideId) {
        if self.mode == SelectionMode::Weighted {
            let mut idx = 0;
            while idx < self.ids.len() {
                if &self.ids[idx] == id {
                    self.ids.remove(idx);
                    if idx < self.weights.len() {
                        self.weights.remove(idx);
                    }
                } else {
                    idx += 1;
                }
            }
        } else {
            self.ids.retain(|candidate| candidate != id);
        }
    }
}

/// Ordered rotation of selection rules.
///
/// The head item decides the current slide. Its choice is resolved on first
/// use and kept until the next [`Playlist::advance`], so a random or weighted
/// slot never re-rolls while its slide is on screen.
#[derive(Debug, Clone)]
pub struct Playlist {
    items: VecDeque<PlaylistItem>,
    current: Option<SlideId>,
    explicit: bool,
    rng: StdRng,
}

impl Default for Playlist {
    fn default() -> Self {
        Self::new(None)
    }
}

impl Playlist {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            items: VecDeque::new(),
            current: None,
            explicit: false,
            rng,
        }
    }

    /// A configured playlist; items are ordered by their `position`.
    pub fn from_items(items: Vec<PlaylistItem>, seed: Option<u64>) -> Result<Self, SlideError> {
        let mut playlist = Self::new(seed);
        let mut items = items;
        items.sort_by_key(|item| item.position);
        for item in items {
            playlist.add(item)?;
        }
        playlist.explicit = true;
        Ok(playlist)
    }

    /// Whether the rotation was configured rather than built from adds.
    pub fn is_explicit(&self) -> bool {
        self.explicit
    }

    pub fn add(&mut self, item: PlaylistItem) -> Result<(), SlideError> {
        item.validate()?;
        debug!(position = item.position, mode = ?item.mode, ids = ?item.ids, "playlist item added");
        self.items.push_back(item);
        Ok(())
    }

    /// Appends a single-mode slot for `id` unless some slot already offers it.
    pub fn ensure_single(&mut self, id: &SlideId) {
        if self.items.iter().any(|item| item.ids.contains(id)) {
            return;
        }
        let position = self.items.len();
        self.items.push_back(PlaylistItem::single(position, id.clone()));
    }

    pub fn remove_id(&mut self, id: &SlideId) {
        let head_before = self.items.front().cloned();
        for item in self.items.iter_mut() {
            item.remove_id(id);
        }
        self.items.retain(|item| !item.ids.is_empty());
        if self.current.as_ref() == Some(id) || self.items.front() != head_before.as_ref() {
            self.current = None;
        }
    }

    /// The head item's selection, resolved once per rotation.
    pub fn current(&mut self) -> Option<SlideId> {
        if self.current.is_none() {
            let head = self.items.front()?;
            self.current = head.pick(&mut self.rng);
            if let Some(id) = &self.current {
                debug!(slide = %id, mode = ?head.mode, "playlist picked slide");
            }
        }
        self.current.clone()
    }

    /// The cached selection without resolving a new one.
    pub fn selected(&self) -> Option<&SlideId> {
        self.current.as_ref()
    }

    pub fn advance(&mut self, direction: Direction) {
        if self.items.is_empty() {
            return;
        }
        match direction {
            Direction::Forward => self.items.rotate_left(1),
            Direction::Reverse => self.items.rotate_right(1),
        }
        self.current = None;
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// More than one distinct slide can come up in rotation.
    pub fn has_alternatives(&self) -> bool {
        let mut seen = HashSet::new();
        for item in &self.items {
            for id in item.selectable() {
                seen.insert(id);
                if seen.len() > 1 {
                    return true;
                }
            }
        }
        false
    }

    pub fn items(&self) -> Vec<PlaylistItem> {
        self.items.iter().cloned().collect()
    }
}
