//! Merged iteration across a column family's SST files and its direct-write
//! overlay.
//!
//! Sources are individually sorted; the iterator surfaces the union in
//! ascending key order with the overlay shadowing SST entries and newer SSTs
//! shadowing older ones. The upper bound is exclusive and a wall-clock
//! deadline, when set, turns further advances into a `TimedOut` status.

use std::collections::VecDeque;
use std::time::Instant;

use super::sst::SstFileIter;
use super::{EngineResult, ReadOptions, Status};

enum SourceKind {
    /// File-backed source; position driven through the sst iterator.
    Sst(SstFileIter),
    /// Snapshot of the column family's direct-write overlay.
    Mem(VecDeque<(Vec<u8>, Vec<u8>)>),
}

struct Source {
    kind: SourceKind,
    current: Option<(Vec<u8>, Vec<u8>)>,
}

impl Source {
    fn seek(&mut self, target: &[u8]) -> EngineResult<()> {
        match &mut self.kind {
            SourceKind::Sst(iter) => {
                iter.seek(target)?;
                self.current = iter.current().map(|(k, v)| (k.to_vec(), v.to_vec()));
            }
            SourceKind::Mem(entries) => {
                while entries
                    .front()
                    .is_some_and(|(k, _)| k.as_slice() < target)
                {
                    entries.pop_front();
                }
                self.current = entries.pop_front();
            }
        }
        Ok(())
    }

    fn advance(&mut self) -> EngineResult<()> {
        match &mut self.kind {
            SourceKind::Sst(iter) => {
                iter.advance()?;
                self.current = iter.current().map(|(k, v)| (k.to_vec(), v.to_vec()));
            }
            SourceKind::Mem(entries) => {
                self.current = entries.pop_front();
            }
        }
        Ok(())
    }
}

/// A forward iterator over one column family.
///
/// Mirrors the native engine's cursor contract: position with [`seek`],
/// then loop on [`valid`]/[`key`]/[`value`]/[`next`], and inspect
/// [`status`] once the loop ends to distinguish exhaustion from failure.
///
/// [`seek`]: DbIterator::seek
/// [`valid`]: DbIterator::valid
/// [`key`]: DbIterator::key
/// [`value`]: DbIterator::value
/// [`next`]: DbIterator::next
/// [`status`]: DbIterator::status
pub struct DbIterator {
    sources: Vec<Source>,
    current: Option<(Vec<u8>, Vec<u8>)>,
    lower: Option<Vec<u8>>,
    upper: Option<Vec<u8>>,
    deadline: Option<Instant>,
    status: Option<Status>,
}

impl DbIterator {
    /// Builds an iterator over the overlay snapshot plus the given SST
    /// iterators. Overlay shadows files; later files shadow earlier ones.
    pub(crate) fn new(
        mem: Vec<(Vec<u8>, Vec<u8>)>,
        sst_iters: Vec<SstFileIter>,
        options: &ReadOptions,
    ) -> Self {
        let mut sources = Vec::with_capacity(sst_iters.len() + 1);
        sources.push(Source {
            kind: SourceKind::Mem(mem.into()),
            current: None,
        });
        // Newest file first so ties resolve toward the latest import.
        for iter in sst_iters.into_iter().rev() {
            sources.push(Source {
                kind: SourceKind::Sst(iter),
                current: None,
            });
        }
        Self {
            sources,
            current: None,
            lower: options.iterate_lower_bound.clone(),
            upper: options.iterate_upper_bound.clone(),
            deadline: options.deadline,
            status: None,
        }
    }

    /// Positions at the first key `>= target` (clamped to the lower bound).
    pub fn seek(&mut self, target: &[u8]) {
        if self.check_deadline() {
            return;
        }
        let effective = match &self.lower {
            Some(lower) if lower.as_slice() > target => lower.clone(),
            _ => target.to_vec(),
        };
        for source in &mut self.sources {
            if let Err(status) = source.seek(&effective) {
                self.fail(status);
                return;
            }
        }
        self.pick_current();
    }

    /// True iff the iterator is positioned on a key inside the bounds and no
    /// error has occurred.
    pub fn valid(&self) -> bool {
        self.status.is_none() && self.current.is_some()
    }

    /// Key at the current position. Panics when `!valid()`.
    pub fn key(&self) -> &[u8] {
        &self.current.as_ref().expect("iterator not valid").0
    }

    /// Value at the current position. Panics when `!valid()`.
    pub fn value(&self) -> &[u8] {
        &self.current.as_ref().expect("iterator not valid").1
    }

    /// Advances to the next key in ascending order.
    pub fn next(&mut self) {
        if self.check_deadline() || self.status.is_some() {
            return;
        }
        let Some((cur_key, _)) = self.current.take() else {
            return;
        };
        for source in &mut self.sources {
            if source
                .current
                .as_ref()
                .is_some_and(|(k, _)| k.as_slice() == cur_key.as_slice())
            {
                if let Err(status) = source.advance() {
                    self.fail(status);
                    return;
                }
            }
        }
        self.pick_current();
    }

    /// Error observed during iteration, if any.
    pub fn status(&self) -> EngineResult<()> {
        match &self.status {
            Some(status) => Err(status.clone()),
            None => Ok(()),
        }
    }

    fn pick_current(&mut self) {
        let mut best: Option<usize> = None;
        for (idx, source) in self.sources.iter().enumerate() {
            let Some((key, _)) = &source.current else {
                continue;
            };
            match best {
                Some(b) if self.sources[b].current.as_ref().unwrap().0 <= *key => {}
                _ => best = Some(idx),
            }
        }
        self.current = match best {
            Some(idx) => self.sources[idx].current.clone(),
            None => None,
        };
        if let (Some((key, _)), Some(upper)) = (&self.current, &self.upper) {
            if key >= upper {
                self.current = None;
            }
        }
    }

    fn check_deadline(&mut self) -> bool {
        if let Some(deadline) = self.deadline {
            if Instant::now() > deadline {
                self.fail(Status::timed_out("checkpoint read deadline exceeded"));
                return true;
            }
        }
        false
    }

    fn fail(&mut self, status: Status) {
        self.status = Some(status);
        self.current = None;
    }
}
