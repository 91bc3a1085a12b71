use std::{
    collections::{HashMap, HashSet, VecDeque},
    time::{Duration, Instant},
};

use log::{debug, info, warn};
use parking_lot::Mutex;
use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};

/// How many files are in every state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    pub pending: usize,
    pub in_flight: usize,
    pub finished: usize,
}

#[derive(Debug)]
struct State {
    files: Vec<String>,
    pending: VecDeque<String>,
    in_flight: HashMap<String, Instant>,
    finished: HashSet<String>,
    rng: StdRng,
}

/// A thread safe work queue handing training files to workers.
///
/// Every file of the epoch is always in exactly one of pending, in flight or
/// finished. In flight files older than the timeout go back to pending the next
/// time a file is requested.
#[derive(Debug)]
pub struct FileDispatcher {
    reverse: bool,
    shuffle: bool,
    timeout: Duration,
    state: Mutex<State>,
}

impl FileDispatcher {
    /// Creates a new `FileDispatcher` with no files.
    ///
    /// # Arguments
    /// * `reverse` - Consume the files back to front.
    /// * `shuffle` - Shuffle the files on `pre_train` and on every `pre_epoch`.
    /// * `timeout` - How long a file may stay in flight, zero disables reclamation.
    /// * `seed` - Seeds the shuffles, a random seed is used if `None`.
    pub fn new(reverse: bool, shuffle: bool, timeout: Duration, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        Self {
            reverse,
            shuffle,
            timeout,
            state: Mutex::new(State {
                files: Vec::new(),
                pending: VecDeque::new(),
                in_flight: HashMap::new(),
                finished: HashSet::new(),
                rng,
            }),
        }
    }

    /// Installs the full file list, duplicates are dropped.
    pub fn pre_train(&self, files: Vec<String>) {
        let mut state = self.state.lock();
        let State { files: all, rng, .. } = &mut *state;

        let mut seen = HashSet::new();
        all.clear();
        for file in files {
            if seen.insert(file.clone()) {
                all.push(file);
            } else {
                warn!("duplicate file {file} dropped");
            }
        }

        if self.shuffle {
            all.shuffle(rng);
        }

        info!(files = all.len(); "files installed");
    }

    /// Puts every file back to pending.
    pub fn pre_epoch(&self) {
        let mut state = self.state.lock();
        let State {
            files,
            pending,
            in_flight,
            finished,
            rng,
        } = &mut *state;

        if self.shuffle {
            files.shuffle(rng);
        }

        pending.clear();
        pending.extend(files.iter().cloned());
        in_flight.clear();
        finished.clear();
    }

    /// Hands a file to a worker.
    ///
    /// # Returns
    /// The file or `None` if there is nothing pending, callers are expected to back off.
    pub fn dispatch(&self) -> Option<String> {
        self.dispatch_at(Instant::now())
    }

    fn dispatch_at(&self, now: Instant) -> Option<String> {
        let mut state = self.state.lock();

        if !self.timeout.is_zero() {
            let expired: Vec<String> = state
                .in_flight
                .iter()
                .filter(|&(_, &at)| now.saturating_duration_since(at) > self.timeout)
                .map(|(file, _)| file.clone())
                .collect();

            for file in expired {
                warn!("file {file} timed out");
                state.in_flight.remove(&file);
                self.requeue(&mut state.pending, file);
            }
        }

        let file = if self.reverse {
            state.pending.pop_back()
        } else {
            state.pending.pop_front()
        };

        match &file {
            Some(file) => {
                debug!("file {file} dispatched");
                state.in_flight.insert(file.clone(), now);
            }
            None => debug!("no file to dispatch"),
        }

        file
    }

    /// Marks a file as done.
    ///
    /// # Returns
    /// `true` only if the file was in flight, stale or duplicate finishes return `false`.
    pub fn finish(&self, file: &str) -> bool {
        let mut state = self.state.lock();

        if state.in_flight.remove(file).is_none() {
            return false;
        }

        state.finished.insert(file.to_string());
        true
    }

    /// Puts an in flight file back to pending, so it's the next one to be dispatched.
    ///
    /// # Returns
    /// `false` if the file wasn't in flight, nothing changes then.
    pub fn failure(&self, file: &str) -> bool {
        let mut state = self.state.lock();

        if state.in_flight.remove(file).is_none() {
            return false;
        }

        warn!("file {file} failed");
        self.requeue(&mut state.pending, file.to_string());
        true
    }

    /// Returns `true` once every file of the epoch is finished.
    pub fn is_epoch_complete(&self) -> bool {
        let state = self.state.lock();
        state.pending.is_empty()
            && state.in_flight.is_empty()
            && state.finished.len() == state.files.len()
    }

    pub fn counts(&self) -> Counts {
        let state = self.state.lock();

        Counts {
            pending: state.pending.len(),
            in_flight: state.in_flight.len(),
            finished: state.finished.len(),
        }
    }

    fn requeue(&self, pending: &mut VecDeque<String>, file: String) {
        if self.reverse {
            pending.push_back(file);
        } else {
            pending.push_front(file);
        }
    }
}
