//! Draws share the read lock and claim recipients with a compare-and-set.
//! Global runs hold the write lock from search to commit.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};

use rand::seq::SliceRandom;
use rand::Rng;
use tracing::{debug, info};

use crate::draw::{admits, family_of};
use crate::search::{self, SearchOptions, Solution};
use crate::{DrawOutcome, MatchError, Participant, ParticipantId};

struct Seat {
    participant: Participant,
    assigned_to: Mutex<Option<ParticipantId>>,
    claimed: AtomicBool,
}

impl Seat {
    fn new(mut participant: Participant) -> Self {
        let assigned_to = participant.assigned_to.take();
        let claimed = participant.claimed;
        participant.reset();
        Self {
            participant,
            assigned_to: Mutex::new(assigned_to),
            claimed: AtomicBool::new(claimed),
        }
    }

    fn snapshot(&self) -> Result<Participant, MatchError> {
        let assigned_to = self
            .assigned_to
            .lock()
            .map_err(|_| MatchError::LockPoisoned("seat.snapshot"))?
            .clone();
        Ok(Participant {
            assigned_to,
            claimed: self.claimed.load(Ordering::Acquire),
            ..self.participant.clone()
        })
    }
}

#[derive(Default)]
pub struct Roster {
    seats: RwLock<Vec<Seat>>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_participants(participants: Vec<Participant>) -> Result<Self, MatchError> {
        let roster = Self::new();
        for participant in participants {
            roster.add(participant)?;
        }
        Ok(roster)
    }

    pub fn add(&self, participant: Participant) -> Result<(), MatchError> {
        let mut seats = self
            .seats
            .write()
            .map_err(|_| MatchError::LockPoisoned("roster.add"))?;
        if let Some(clash) = seats
            .iter()
            .find(|s| s.participant.id == participant.id || s.participant.name == participant.name)
        {
            let taken = if clash.participant.id == participant.id {
                participant.id
            } else {
                participant.name
            };
            return Err(MatchError::DuplicateParticipant(taken));
        }
        seats.push(Seat::new(participant));
        Ok(())
    }

    pub fn len(&self) -> Result<usize, MatchError> {
        Ok(self
            .seats
            .read()
            .map_err(|_| MatchError::LockPoisoned("roster.len"))?
            .len())
    }

    pub fn is_empty(&self) -> Result<bool, MatchError> {
        self.len().map(|len| len == 0)
    }

    pub fn snapshot(&self) -> Result<Vec<Participant>, MatchError> {
        let seats = self
            .seats
            .read()
            .map_err(|_| MatchError::LockPoisoned("roster.snapshot"))?;
        seats.iter().map(Seat::snapshot).collect()
    }

    pub fn get(&self, id: &str) -> Result<Option<Participant>, MatchError> {
        let seats = self
            .seats
            .read()
            .map_err(|_| MatchError::LockPoisoned("roster.get"))?;
        seats
            .iter()
            .find(|s| s.participant.id == id)
            .map(Seat::snapshot)
            .transpose()
    }

    pub fn find_by_name(&self, name: &str) -> Result<Option<Participant>, MatchError> {
        let seats = self
            .seats
            .read()
            .map_err(|_| MatchError::LockPoisoned("roster.find_by_name"))?;
        seats
            .iter()
            .find(|s| s.participant.name == name)
            .map(Seat::snapshot)
            .transpose()
    }

    /// Removes a participant who has neither drawn nor been drawn. Returns
    /// `false` when the id is unknown or already part of an assignment.
    pub fn withdraw(&self, id: &str) -> Result<bool, MatchError> {
        let mut seats = self
            .seats
            .write()
            .map_err(|_| MatchError::LockPoisoned("roster.withdraw"))?;
        let Some(index) = seats.iter().position(|s| s.participant.id == id) else {
            return Ok(false);
        };
        let seat = &mut seats[index];
        let has_drawn = seat
            .assigned_to
            .get_mut()
            .map_err(|_| MatchError::LockPoisoned("seat.assigned_to"))?
            .is_some();
        if has_drawn || *seat.claimed.get_mut() {
            return Ok(false);
        }
        seats.remove(index);
        Ok(true)
    }

    /// A recipient lost to a concurrent draw is dropped from the pool and the
    /// draw repeats; only an empty pool is an error.
    pub fn draw_for<R: Rng + ?Sized>(
        &self,
        giver_id: &str,
        rng: &mut R,
    ) -> Result<DrawOutcome, MatchError> {
        self.draw_with(giver_id, rng, |_| {})
    }

    /// `before_claim` sees each pick between pool evaluation and its claim.
    fn draw_with<R, F>(
        &self,
        giver_id: &str,
        rng: &mut R,
        mut before_claim: F,
    ) -> Result<DrawOutcome, MatchError>
    where
        R: Rng + ?Sized,
        F: FnMut(&Seat),
    {
        let seats = self
            .seats
            .read()
            .map_err(|_| MatchError::LockPoisoned("roster.draw"))?;
        let giver = seats
            .iter()
            .find(|s| s.participant.id == giver_id)
            .ok_or_else(|| MatchError::UnknownParticipant(giver_id.to_string()))?;
        let family = family_of(&giver.participant)?;

        let mut assigned = giver
            .assigned_to
            .lock()
            .map_err(|_| MatchError::LockPoisoned("seat.assigned_to"))?;
        if let Some(existing) = assigned.as_ref() {
            return Ok(DrawOutcome::AlreadyAssigned(existing.clone()));
        }

        let mut lost = vec![false; seats.len()];
        loop {
            let pool: Vec<usize> = seats
                .iter()
                .enumerate()
                .filter(|(index, seat)| {
                    !lost[*index]
                        && admits(
                            &giver.participant,
                            family,
                            &seat.participant,
                            seat.claimed.load(Ordering::Acquire),
                        )
                })
                .map(|(index, _)| index)
                .collect();

            let Some(&pick) = pool.choose(rng) else {
                return Err(MatchError::NoEligibleRecipient {
                    giver: giver_id.to_string(),
                });
            };

            let recipient = &seats[pick];
            before_claim(recipient);
            if recipient
                .claimed
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let recipient_id = recipient.participant.id.clone();
                *assigned = Some(recipient_id.clone());
                return Ok(DrawOutcome::Assigned(recipient_id));
            }

            debug!(giver = giver_id, recipient = %recipient.participant.id, "recipient claimed concurrently, drawing again");
            lost[pick] = true;
        }
    }

    /// On failure the previous assignments are left exactly as they were.
    pub fn generate<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        options: SearchOptions,
    ) -> Result<Solution, MatchError> {
        let mut seats = self
            .seats
            .write()
            .map_err(|_| MatchError::LockPoisoned("roster.generate"))?;
        let participants: Vec<Participant> = seats.iter().map(|s| s.participant.clone()).collect();

        let solution = search::solve(&participants, rng, options)?;
        solution.assignment.verify(&participants)?;

        for seat in seats.iter_mut() {
            let assigned_to = seat
                .assigned_to
                .get_mut()
                .map_err(|_| MatchError::LockPoisoned("seat.assigned_to"))?;
            *assigned_to = solution.assignment.recipient_of(&seat.participant.id).cloned();
            *seat.claimed.get_mut() = false;
        }
        for (_, recipient) in solution.assignment.iter() {
            if let Some(seat) = seats.iter_mut().find(|s| &s.participant.id == recipient) {
                *seat.claimed.get_mut() = true;
            }
        }

        info!(
            participants = participants.len(),
            steps = solution.stats.steps,
            backtracks = solution.stats.backtracks,
            "exchange generated"
        );
        Ok(solution)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::roster_of;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use std::collections::HashSet;
    use std::sync::{Arc, Barrier};
    use std::thread;

    fn roster(members: &[(&str, &str)]) -> Roster {
        Roster::from_participants(roster_of(members)).unwrap()
    }

    #[test]
    fn duplicate_ids_and_names_are_rejected() {
        let roster = roster(&[("a1", "A")]);
        let err = roster.add(Participant::new("a1", "someone", "B")).unwrap_err();
        assert_eq!(err, MatchError::DuplicateParticipant("a1".into()));
        let err = roster.add(Participant::new("zz", "a1", "B")).unwrap_err();
        assert_eq!(err, MatchError::DuplicateParticipant("a1".into()));
        assert_eq!(roster.len().unwrap(), 1);
    }

    #[test]
    fn restored_state_survives_round_trip() {
        let mut people = roster_of(&[("a1", "A"), ("b1", "B")]);
        people[0].assigned_to = Some("b1".into());
        people[1].claimed = true;
        let roster = Roster::from_participants(people.clone()).unwrap();
        assert_eq!(roster.snapshot().unwrap(), people);
        assert_eq!(roster.find_by_name("b1").unwrap(), Some(people[1].clone()));
        assert_eq!(roster.get("nope").unwrap(), None);
    }

    #[test]
    fn generate_commits_a_full_exchange() {
        let roster = roster(&[("a1", "A"), ("a2", "A"), ("b1", "B"), ("b2", "B")]);
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        roster.draw_for("a1", &mut rng).unwrap();

        let solution = roster.generate(&mut rng, SearchOptions::default()).unwrap();
        let people = roster.snapshot().unwrap();

        assert!(people.iter().all(|p| p.claimed));
        for person in &people {
            assert_eq!(
                person.assigned_to.as_ref(),
                solution.assignment.recipient_of(&person.id)
            );
        }
        assert_eq!(solution.assignment.verify(&people), Ok(()));
    }

    #[test]
    fn failed_generate_keeps_previous_state() {
        let roster = roster(&[("a1", "A"), ("a2", "A"), ("b1", "B")]);
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let drawn = roster.draw_for("b1", &mut rng).unwrap();
        let before = roster.snapshot().unwrap();

        let err = roster.generate(&mut rng, SearchOptions::default()).unwrap_err();

        assert_eq!(err, MatchError::Infeasible { participants: 3 });
        assert_eq!(roster.snapshot().unwrap(), before);
        assert!(drawn.is_new());
    }

    #[test]
    fn draw_is_idempotent_per_giver() {
        let roster = roster(&[("a1", "A"), ("b1", "B"), ("c1", "C")]);
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        let first = roster.draw_for("a1", &mut rng).unwrap();
        let before = roster.snapshot().unwrap();
        let second = roster.draw_for("a1", &mut rng).unwrap();
        assert_eq!(second, DrawOutcome::AlreadyAssigned(first.recipient().clone()));
        assert_eq!(roster.snapshot().unwrap(), before);
    }

    #[test]
    fn same_family_pair_cannot_draw_or_generate() {
        let roster = roster(&[("a1", "A"), ("a2", "A")]);
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        assert_eq!(
            roster.draw_for("a1", &mut rng).unwrap_err(),
            MatchError::NoEligibleRecipient { giver: "a1".into() }
        );
        assert_eq!(
            roster.generate(&mut rng, SearchOptions::default()).unwrap_err(),
            MatchError::Infeasible { participants: 2 }
        );
        assert!(roster
            .snapshot()
            .unwrap()
            .iter()
            .all(|p| p.assigned_to.is_none() && !p.claimed));
    }

    #[test]
    fn withdraw_only_removes_untouched_participants() {
        let roster = roster(&[("a1", "A"), ("b1", "B"), ("c1", "C"), ("d1", "D")]);
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        let drawn = roster.draw_for("a1", &mut rng).unwrap();
        roster.add(Participant::new("x1", "x1", "X")).unwrap();

        assert!(!roster.withdraw("a1").unwrap());
        assert!(!roster.withdraw(drawn.recipient()).unwrap());
        assert!(!roster.withdraw("nobody").unwrap());
        assert!(roster.withdraw("x1").unwrap());

        assert_eq!(roster.len().unwrap(), 4);
        assert_eq!(roster.get("x1").unwrap(), None);
    }

    #[test]
    fn lost_claim_redraws_from_the_remaining_pool() {
        let roster = roster(&[("a1", "A"), ("b1", "B"), ("c1", "C")]);
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let mut taken = Vec::new();

        let outcome = roster
            .draw_with("a1", &mut rng, |seat| {
                if taken.is_empty() {
                    seat.claimed.store(true, Ordering::Release);
                }
                taken.push(seat.participant.id.clone());
            })
            .unwrap();

        assert_eq!(taken.len(), 2);
        assert_ne!(taken[0], taken[1]);
        assert_eq!(outcome, DrawOutcome::Assigned(taken[1].clone()));
        let people = roster.snapshot().unwrap();
        assert_eq!(people[0].assigned_to.as_ref(), Some(&taken[1]));
        assert!(people[1].claimed && people[2].claimed);
    }

    #[test]
    fn losing_the_last_candidate_reports_no_eligible_recipient() {
        let roster = roster(&[("a1", "A"), ("b1", "B")]);
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let mut attempts = 0;

        let err = roster
            .draw_with("a1", &mut rng, |seat| {
                seat.claimed.store(true, Ordering::Release);
                attempts += 1;
            })
            .unwrap_err();

        assert_eq!(err, MatchError::NoEligibleRecipient { giver: "a1".into() });
        assert_eq!(attempts, 1);
        assert_eq!(roster.get("a1").unwrap().unwrap().assigned_to, None);
    }

    #[test]
    fn concurrent_draws_claim_distinct_recipients() {
        // Givers in family G, recipients each in their own family.
        const M: usize = 16;
        let mut people = Vec::new();
        for i in 0..M {
            people.push(Participant::new(format!("g{i}"), format!("g{i}"), "G"));
            people.push(Participant::new(format!("r{i}"), format!("r{i}"), format!("R{i}")));
        }
        let roster = Arc::new(Roster::from_participants(people).unwrap());
        let barrier = Arc::new(Barrier::new(M));

        let handles: Vec<_> = (0..M)
            .map(|i| {
                let roster = Arc::clone(&roster);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    let mut rng = ChaCha8Rng::seed_from_u64(i as u64);
                    barrier.wait();
                    roster.draw_for(&format!("g{i}"), &mut rng)
                })
            })
            .collect();

        let recipients: Vec<ParticipantId> = handles
            .into_iter()
            .map(|h| h.join().unwrap().unwrap().recipient().clone())
            .collect();
        let distinct: HashSet<&ParticipantId> = recipients.iter().collect();
        assert_eq!(distinct.len(), M);

        let claimed = roster.snapshot().unwrap().into_iter().filter(|p| p.claimed).count();
        assert_eq!(claimed, M);
    }
}
