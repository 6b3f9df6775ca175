//! Next/previous channel resolution over the flattened directory.

use std::collections::BTreeSet;

use tvplay_proto::channels::ChannelDirectory;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Next,
    Prev,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavOutcome {
    Stay,
    Select {
        idx: usize,
        /// The favorites list is closed before switching.
        leave_favorites: bool,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct NavContext<'a> {
    pub favorites: &'a BTreeSet<String>,
    pub favorites_visible: bool,
    pub boundary_jump_out: bool,
}

/// One step through `len` items with wraparound.  Without a current position
/// `Next` lands on the first item and `Prev` on the last.
pub fn step(len: usize, current: Option<usize>, direction: Direction) -> Option<usize> {
    if len == 0 {
        return None;
    }
    Some(match (current, direction) {
        (None, Direction::Next) => 0,
        (None, Direction::Prev) => len - 1,
        (Some(i), Direction::Next) => (i + 1) % len,
        (Some(i), Direction::Prev) => (i + len - 1) % len,
    })
}

/// Resolve where next/previous goes from the channel at `current` (a
/// flattened index, `None` when the current channel is not in `directory`).
pub fn resolve(
    directory: &ChannelDirectory,
    current: Option<usize>,
    direction: Direction,
    ctx: NavContext<'_>,
) -> NavOutcome {
    if !ctx.favorites_visible {
        return match step(directory.len(), current, direction) {
            Some(idx) => NavOutcome::Select {
                idx,
                leave_favorites: false,
            },
            None => NavOutcome::Stay,
        };
    }

    let favorites = directory.favorite_indices(ctx.favorites);
    if favorites.is_empty() {
        return NavOutcome::Stay;
    }

    let pos = current.and_then(|c| favorites.iter().position(|&f| f == c));
    let last = favorites.len() - 1;
    let inner = match (pos, direction) {
        (Some(p), Direction::Next) if p < last => Some(p + 1),
        (Some(p), Direction::Prev) if p > 0 => Some(p - 1),
        _ => None,
    };
    if let Some(p) = inner {
        return NavOutcome::Select {
            idx: favorites[p],
            leave_favorites: false,
        };
    }

    // Leaving the favorites lands on the matching end of the full directory.
    if ctx.boundary_jump_out {
        let idx = match direction {
            Direction::Next => directory.len() - 1,
            Direction::Prev => 0,
        };
        return NavOutcome::Select {
            idx,
            leave_favorites: true,
        };
    }

    let wrapped = match direction {
        Direction::Next => favorites[0],
        Direction::Prev => favorites[last],
    };
    NavOutcome::Select {
        idx: wrapped,
        leave_favorites: false,
    }
}
