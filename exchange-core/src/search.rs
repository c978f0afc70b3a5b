use std::collections::HashMap;

use rand::seq::SliceRandom;
use rand::Rng;
use tracing::debug;

use crate::{Assignment, MatchError, Participant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchOptions {
    /// Upper bound on tentative claims before giving up with
    /// [`MatchError::StepBudgetExceeded`]. `None` searches without limit.
    pub max_steps: Option<u64>,
    pub forward_check: bool,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            max_steps: None,
            forward_check: true,
        }
    }
}

impl SearchOptions {
    pub fn with_max_steps(mut self, max_steps: u64) -> Self {
        self.max_steps = Some(max_steps);
        self
    }

    pub fn exhaustive(mut self) -> Self {
        self.forward_check = false;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SearchStats {
    pub steps: u64,
    pub backtracks: u64,
    pub pruned: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Solution {
    pub assignment: Assignment,
    pub stats: SearchStats,
}

struct Frame {
    giver: usize,
    candidates: Vec<usize>,
    cursor: usize,
    choice: Option<usize>,
}

impl Frame {
    fn new<R: Rng + ?Sized>(giver: usize, participants: usize, rng: &mut R) -> Self {
        let mut candidates: Vec<usize> = (0..participants).collect();
        candidates.shuffle(rng);
        Self {
            giver,
            candidates,
            cursor: 0,
            choice: None,
        }
    }

    fn next_candidate(&mut self) -> Option<usize> {
        let candidate = self.candidates.get(self.cursor).copied();
        self.cursor += 1;
        candidate
    }
}

struct Ledger<'a> {
    families: &'a [usize],
    claimed: Vec<bool>,
    givers_left: Vec<usize>,
    open_left: Vec<usize>,
    open_total: usize,
}

impl<'a> Ledger<'a> {
    fn new(families: &'a [usize], family_count: usize) -> Self {
        let mut sizes = vec![0; family_count];
        for &family in families {
            sizes[family] += 1;
        }
        Self {
            families,
            claimed: vec![false; families.len()],
            givers_left: sizes.clone(),
            open_left: sizes,
            open_total: families.len(),
        }
    }

    fn admits(&self, giver: usize, candidate: usize) -> bool {
        candidate != giver
            && self.families[candidate] != self.families[giver]
            && !self.claimed[candidate]
    }

    fn claim(&mut self, giver: usize, recipient: usize) {
        self.claimed[recipient] = true;
        self.givers_left[self.families[giver]] -= 1;
        self.open_left[self.families[recipient]] -= 1;
        self.open_total -= 1;
    }

    fn release(&mut self, giver: usize, recipient: usize) {
        self.claimed[recipient] = false;
        self.givers_left[self.families[giver]] += 1;
        self.open_left[self.families[recipient]] += 1;
        self.open_total += 1;
    }

    /// Hall's condition for this graph: every family's remaining givers must
    /// fit into the unclaimed recipients outside that family. Givers from two
    /// or more families can reach every open recipient, so checking single
    /// families is both necessary and sufficient.
    fn completable(&self) -> bool {
        self.givers_left
            .iter()
            .zip(&self.open_left)
            .all(|(&givers, &open)| givers <= self.open_total - open)
    }
}

fn family_indices(participants: &[Participant]) -> Result<(Vec<usize>, usize), MatchError> {
    let mut labels: HashMap<&str, usize> = HashMap::new();
    let mut families = Vec::with_capacity(participants.len());
    for participant in participants {
        let label = participant
            .family()
            .ok_or_else(|| MatchError::MissingFamily {
                participant: participant.id.clone(),
            })?;
        let next = labels.len();
        families.push(*labels.entry(label).or_insert(next));
    }
    Ok((families, labels.len()))
}

/// Ignores whatever assignment or claimed state `participants` carry.
pub fn solve<R: Rng + ?Sized>(
    participants: &[Participant],
    rng: &mut R,
    options: SearchOptions,
) -> Result<Solution, MatchError> {
    let count = participants.len();
    if count < 2 {
        return Err(MatchError::InsufficientParticipants { count });
    }
    let (families, family_count) = family_indices(participants)?;

    let mut order: Vec<usize> = (0..count).collect();
    order.shuffle(rng);

    let mut ledger = Ledger::new(&families, family_count);
    let mut stats = SearchStats::default();

    if options.forward_check && !ledger.completable() {
        debug!(participants = count, families = family_count, "family distribution cannot be matched");
        return Err(MatchError::Infeasible { participants: count });
    }

    let mut stack: Vec<Frame> = Vec::with_capacity(count);
    stack.push(Frame::new(order[0], count, rng));

    while let Some(frame) = stack.last_mut() {
        let giver = frame.giver;
        if let Some(previous) = frame.choice.take() {
            ledger.release(giver, previous);
        }

        let mut chosen = None;
        while let Some(candidate) = frame.next_candidate() {
            if !ledger.admits(giver, candidate) {
                continue;
            }
            if options.max_steps.is_some_and(|limit| stats.steps >= limit) {
                debug!(?stats, "step budget exhausted");
                return Err(MatchError::StepBudgetExceeded { steps: stats.steps });
            }
            stats.steps += 1;
            ledger.claim(giver, candidate);
            if options.forward_check && !ledger.completable() {
                ledger.release(giver, candidate);
                stats.pruned += 1;
                continue;
            }
            chosen = Some(candidate);
            break;
        }

        match chosen {
            Some(recipient) => {
                frame.choice = Some(recipient);
                let depth = stack.len();
                if depth == count {
                    debug!(?stats, participants = count, "exchange found");
                    return Ok(Solution {
                        assignment: collect(participants, &stack),
                        stats,
                    });
                }
                stack.push(Frame::new(order[depth], count, rng));
            }
            None => {
                stack.pop();
                stats.backtracks += 1;
            }
        }
    }

    debug!(?stats, participants = count, "search exhausted");
    Err(MatchError::Infeasible { participants: count })
}

fn collect(participants: &[Participant], stack: &[Frame]) -> Assignment {
    let mut assignment = Assignment::default();
    for frame in stack {
        if let Some(recipient) = frame.choice {
            assignment.insert(
                participants[frame.giver].id.clone(),
                participants[recipient].id.clone(),
            );
        }
    }
    assignment
}
