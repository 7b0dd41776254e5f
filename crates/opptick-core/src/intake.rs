//! Multi-turn dialog that turns an inbound message into a saved opportunity.
//!
//! One session per `(owner_id, conversation_id)`, persisted after every
//! turn so a restart resumes where the user left off. Turns for the same
//! conversation are serialized by a keyed lock; different conversations
//! proceed in parallel.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::classify::{Classifier, KeywordClassifier};
use crate::config::{OppTickConfig, SummaryConfig};
use crate::error::Result;
use crate::extract::{DeadlineCandidate, DeadlineExtractor, PatternExtractor};
use crate::locks::KeyedLocks;
use crate::model::*;
use crate::notify::{Action, InboundMessage};
use crate::scheduler::ReminderScheduler;
use crate::storage::StorageBackend;
use crate::summary::{format_countdown, format_deadline};
use crate::title;
use crate::tracker::ensure_settings;

/// Ambiguous candidates offered as numbered choices.
const MAX_CHOICES: usize = 5;

/// A user reply, normalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Affirm,
    Reject,
    Cancel,
    /// 1-based numeric choice.
    Choice(usize),
    Text(String),
}

impl Reply {
    pub fn parse(text: &str) -> Self {
        let trimmed = text.trim();
        let lower = trimmed.to_lowercase();
        let word = lower.trim_end_matches(['.', '!']);
        match word {
            "/cancel" | "cancel" => Self::Cancel,
            "yes" | "y" | "ok" | "okay" | "correct" | "confirm" => Self::Affirm,
            "no" | "n" | "manual" => Self::Reject,
            _ => match word.parse::<usize>() {
                Ok(n) if n > 0 => Self::Choice(n),
                _ => Self::Text(trimmed.to_string()),
            },
        }
    }
}

/// What the transport shows the user after a turn.
#[derive(Debug, Clone, PartialEq)]
pub struct IntakeReply {
    /// State the dialog is in after this turn.
    pub state: IntakeState,
    pub text: String,
    pub actions: Vec<Action>,
    /// Set on the turn that saved the opportunity.
    pub opportunity_id: Option<Uuid>,
}

impl IntakeReply {
    fn new(state: IntakeState, text: impl Into<String>) -> Self {
        Self {
            state,
            text: text.into(),
            actions: Vec::new(),
            opportunity_id: None,
        }
    }

    fn with_actions(mut self, actions: Vec<Action>) -> Self {
        self.actions = actions;
        self
    }
}

/// Outcome of one turn.
enum Step {
    /// Persist the session in its current state.
    Continue(IntakeReply),
    /// The dialog is over; drop the session.
    Finish(IntakeReply),
}

pub struct IntakeEngine<S, E = PatternExtractor, C = KeywordClassifier> {
    storage: Arc<S>,
    scheduler: ReminderScheduler<S>,
    extractor: E,
    classifier: C,
    locks: KeyedLocks<(String, String)>,
    idle: Duration,
    min_confidence: f32,
    summary_defaults: SummaryConfig,
}

impl<S: StorageBackend> IntakeEngine<S, PatternExtractor, KeywordClassifier> {
    pub fn new(storage: Arc<S>, config: &OppTickConfig) -> Self {
        Self::with_parts(storage, PatternExtractor::new(), KeywordClassifier::new(), config)
    }
}

impl<S: StorageBackend, E: DeadlineExtractor, C: Classifier> IntakeEngine<S, E, C> {
    pub fn with_parts(storage: Arc<S>, extractor: E, classifier: C, config: &OppTickConfig) -> Self {
        Self {
            scheduler: ReminderScheduler::new(Arc::clone(&storage), &config.reminders),
            storage,
            extractor,
            classifier,
            locks: KeyedLocks::new(),
            idle: Duration::minutes(config.intake.session_idle_minutes.max(1)),
            min_confidence: config.intake.min_confidence,
            summary_defaults: config.summary.clone(),
        }
    }

    /// Advance the conversation's dialog by one inbound message. Errors are
    /// storage failures; the persisted session is then the one from before
    /// this turn.
    pub async fn handle(&self, message: &InboundMessage) -> Result<IntakeReply> {
        let key = (message.owner_id.clone(), message.conversation_id.clone());
        let _guard = self.locks.lock(key).await;
        let now = message.timestamp;

        ensure_settings(
            &*self.storage,
            &message.owner_id,
            Some(&message.conversation_id),
            &self.summary_defaults,
        )
        .await?;

        let existing = match self
            .storage
            .get_session(&message.owner_id, &message.conversation_id)
            .await?
        {
            Some(session) if session.is_expired(now) => {
                tracing::debug!(
                    owner = %message.owner_id,
                    conversation = %message.conversation_id,
                    state = %session.state,
                    "intake session expired"
                );
                self.storage
                    .delete_session(&message.owner_id, &message.conversation_id)
                    .await?;
                None
            }
            other => other,
        };

        let reply = Reply::parse(&message.text);
        if reply == Reply::Cancel {
            return match existing {
                Some(_) => {
                    self.storage
                        .delete_session(&message.owner_id, &message.conversation_id)
                        .await?;
                    Ok(IntakeReply::new(
                        IntakeState::AwaitingForward,
                        "Cancelled. Nothing was saved.",
                    ))
                }
                None => Ok(IntakeReply::new(
                    IntakeState::AwaitingForward,
                    "Nothing to cancel.",
                )),
            };
        }

        let mut session = match existing {
            Some(session) if session.state != IntakeState::AwaitingForward => session,
            _ => {
                if message.text.trim().is_empty() {
                    return Ok(IntakeReply::new(
                        IntakeState::AwaitingForward,
                        "Send or forward an opportunity message to start tracking it.",
                    ));
                }
                IntakeSession::new(
                    message.owner_id.clone(),
                    message.conversation_id.clone(),
                    now,
                    self.idle,
                )
            }
        };

        let step = match session.state {
            IntakeState::AwaitingForward => self.start(&mut session, message, now),
            IntakeState::DeadlineProposed => self.on_proposed(&mut session, reply, now),
            IntakeState::AwaitingManualDeadline => self.on_manual(&mut session, &message.text, now),
            IntakeState::DeadlineConfirmed => Step::Continue(self.ask_category(&mut session)),
            IntakeState::TypeSelection => self.on_category(&mut session, reply),
            IntakeState::PrioritySelection => self.on_priority(&mut session, reply),
            IntakeState::TitleConfirmation => self.on_title(&mut session, reply, now).await,
            IntakeState::Saved => Step::Finish(IntakeReply::new(
                IntakeState::AwaitingForward,
                "Already saved. Send another opportunity to track it.",
            )),
        };

        match step {
            Step::Continue(reply) => {
                session.touch(now, self.idle);
                self.storage.save_session(&session).await?;
                Ok(reply)
            }
            Step::Finish(reply) => {
                self.storage
                    .delete_session(&session.owner_id, &session.conversation_id)
                    .await?;
                Ok(reply)
            }
        }
    }

    /// Remove every session idle past its expiry.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let n = self.storage.delete_expired_sessions(now).await?;
        if n > 0 {
            tracing::info!(purged = n, "expired intake sessions removed");
        }
        Ok(n)
    }

    // -- States --

    fn start(&self, session: &mut IntakeSession, message: &InboundMessage, now: DateTime<Utc>) -> Step {
        let text = message.text.trim();
        let suggestion = title::suggest(text);
        let category = self.classifier.classify(text);

        session.draft = Draft {
            source_text: text.to_string(),
            source_ref: message.message_ref.clone(),
            is_forward: message.is_forward,
            suggested_category: Some(category),
            organization: suggestion.organization.clone(),
            summary: suggestion.summary,
            suggested_title: suggestion.title,
            ..Default::default()
        };
        tracing::debug!(
            owner = %session.owner_id,
            category = %category,
            forward = message.is_forward,
            "intake started"
        );

        let heading = match &suggestion.organization {
            Some(org) => format!("New opportunity from {org}."),
            None => "New opportunity.".to_string(),
        };
        let candidates = self.extractor.extract(text, now);
        let mut reply = self.propose(session, candidates, now, false);
        reply.text = format!("{heading}\n\n{}", reply.text);
        Step::Continue(reply)
    }

    fn on_proposed(&self, session: &mut IntakeSession, reply: Reply, now: DateTime<Utc>) -> Step {
        match reply {
            Reply::Affirm => match session.draft.default_proposal {
                Some(i) => self.accept_proposal(session, i, now),
                None => Step::Continue(self.choice_prompt(session, "Reply with the number of the right date.")),
            },
            Reply::Choice(n) if n <= session.draft.proposals.len() => {
                self.accept_proposal(session, n - 1, now)
            }
            Reply::Choice(_) => {
                Step::Continue(self.choice_prompt(session, "That number is not in the list."))
            }
            Reply::Reject | Reply::Cancel => {
                session.draft.proposals.clear();
                session.draft.default_proposal = None;
                session.state = IntakeState::AwaitingManualDeadline;
                Step::Continue(manual_prompt("Okay, send the deadline yourself."))
            }
            Reply::Text(text) => self.on_manual(session, &text, now),
        }
    }

    fn on_manual(&self, session: &mut IntakeSession, text: &str, now: DateTime<Utc>) -> Step {
        let candidates = self.extractor.extract(text, now);
        Step::Continue(self.propose(session, candidates, now, true))
    }

    fn on_category(&self, session: &mut IntakeSession, reply: Reply) -> Step {
        let category = match reply {
            Reply::Affirm => session.draft.suggested_category.or(Some(Category::Other)),
            Reply::Choice(n) => Category::ALL.get(n - 1).copied(),
            Reply::Text(text) => text.parse::<Category>().ok(),
            Reply::Reject | Reply::Cancel => None,
        };
        match category {
            Some(category) => {
                session.draft.category = Some(category);
                session.state = IntakeState::PrioritySelection;
                Step::Continue(priority_prompt(&format!("Type: {category}.")))
            }
            None => Step::Continue(self.ask_category(session)),
        }
    }

    fn on_priority(&self, session: &mut IntakeSession, reply: Reply) -> Step {
        let priority = match reply {
            Reply::Affirm => Some(Priority::Medium),
            Reply::Choice(n) => Priority::ALL.get(n - 1).copied(),
            Reply::Text(text) => text.parse::<Priority>().ok(),
            Reply::Reject | Reply::Cancel => None,
        };
        match priority {
            Some(priority) => {
                session.draft.priority = Some(priority);
                session.state = IntakeState::TitleConfirmation;
                Step::Continue(title_prompt(session, &format!("Priority: {priority}.")))
            }
            None => Step::Continue(priority_prompt("Pick 1-3, or high, medium or low.")),
        }
    }

    async fn on_title(&self, session: &mut IntakeSession, reply: Reply, now: DateTime<Utc>) -> Step {
        let chosen = match reply {
            Reply::Affirm => session.draft.suggested_title.clone(),
            Reply::Reject | Reply::Cancel => String::new(),
            Reply::Choice(n) => n.to_string(),
            Reply::Text(text) => title::normalize_title(&text),
        };
        if chosen.trim().is_empty() {
            return Step::Continue(IntakeReply::new(
                IntakeState::TitleConfirmation,
                "Send the title you want for this opportunity.",
            ));
        }
        // A retry after a failed save reuses this title.
        session.draft.suggested_title = chosen.clone();

        let Some(deadline) = session.draft.deadline.filter(|d| *d > now) else {
            session.draft.deadline = None;
            session.state = IntakeState::AwaitingManualDeadline;
            return Step::Continue(manual_prompt("The deadline has passed meanwhile. Send a new one."));
        };

        let mut opp = Opportunity::new(
            session.owner_id.clone(),
            session.conversation_id.clone(),
            chosen,
            deadline,
        )
        .with_category(session.draft.category.unwrap_or(Category::Other))
        .with_priority(session.draft.priority.unwrap_or_default())
        .with_created_at(now);
        opp.source_ref = session.draft.source_ref.clone();
        let reminders = self.scheduler.build(&opp, now);

        if let Err(e) = self.storage.create_opportunity(&opp, &reminders).await {
            tracing::warn!(owner = %opp.owner_id, error = %e, "saving opportunity failed");
            return Step::Continue(
                IntakeReply::new(
                    IntakeState::TitleConfirmation,
                    format!("Could not save \"{}\". Reply yes to try again.", opp.title),
                )
                .with_actions(vec![yes_action()]),
            );
        }

        session.state = IntakeState::Saved;
        tracing::info!(
            opportunity = %opp.id,
            owner = %opp.owner_id,
            priority = %opp.priority,
            reminders = reminders.len(),
            "opportunity saved"
        );
        let mut reply = IntakeReply::new(IntakeState::Saved, saved_text(&opp, &reminders, now));
        reply.opportunity_id = Some(opp.id);
        Step::Finish(reply)
    }

    // -- Deadline proposals --

    /// Turn extractor output into the next state. `manual` is true when the
    /// text was a deadline typed on request, in which case a confident date
    /// is accepted without asking again.
    fn propose(
        &self,
        session: &mut IntakeSession,
        candidates: Vec<DeadlineCandidate>,
        now: DateTime<Utc>,
        manual: bool,
    ) -> IntakeReply {
        let had_candidates = !candidates.is_empty();
        let future: Vec<ProposedDeadline> = candidates
            .into_iter()
            .filter(|c| c.at > now)
            .map(|c| ProposedDeadline {
                at: c.at,
                confidence: c.confidence,
                matched: c.matched,
            })
            .collect();

        let Some(best) = future.first().cloned() else {
            session.draft.proposals.clear();
            session.draft.default_proposal = None;
            session.state = IntakeState::AwaitingManualDeadline;
            let lead = if had_candidates {
                "That date is already in the past."
            } else if manual {
                "I could not read a date from that."
            } else {
                "I could not find a deadline."
            };
            return manual_prompt(lead);
        };

        if best.confidence >= self.min_confidence {
            if manual {
                return self.accept_deadline(session, best.at);
            }
            session.draft.proposals = vec![best.clone()];
            session.draft.default_proposal = Some(0);
            session.state = IntakeState::DeadlineProposed;
            return IntakeReply::new(
                IntakeState::DeadlineProposed,
                format!(
                    "Deadline detected: {} ({} left)\nIs this correct? Reply yes, or no to enter it yourself.",
                    format_deadline(best.at),
                    format_countdown(best.at, now)
                ),
            )
            .with_actions(vec![yes_action(), Action::new("No", "no")]);
        }

        session.draft.proposals = future.into_iter().take(MAX_CHOICES).collect();
        session.draft.default_proposal = None;
        session.state = IntakeState::DeadlineProposed;
        self.choice_prompt(session, "The date is ambiguous.")
    }

    fn choice_prompt(&self, session: &IntakeSession, lead: &str) -> IntakeReply {
        let mut text = format!("{lead} Which deadline is it?\n");
        let mut actions = Vec::new();
        for (i, p) in session.draft.proposals.iter().enumerate() {
            text.push_str(&format!("\n{}. {} (\"{}\")", i + 1, format_deadline(p.at), p.matched));
            actions.push(Action::new(format_deadline(p.at), (i + 1).to_string()));
        }
        text.push_str("\n\nReply with a number, or no to enter it yourself.");
        IntakeReply::new(IntakeState::DeadlineProposed, text).with_actions(actions)
    }

    fn accept_proposal(&self, session: &mut IntakeSession, index: usize, now: DateTime<Utc>) -> Step {
        match session.draft.proposals.get(index).map(|p| p.at) {
            Some(at) if at > now => Step::Continue(self.accept_deadline(session, at)),
            Some(_) => {
                session.draft.proposals.clear();
                session.draft.default_proposal = None;
                session.state = IntakeState::AwaitingManualDeadline;
                Step::Continue(manual_prompt("That date is already in the past."))
            }
            None => Step::Continue(self.choice_prompt(session, "That number is not in the list.")),
        }
    }

    fn accept_deadline(&self, session: &mut IntakeSession, at: DateTime<Utc>) -> IntakeReply {
        session.draft.deadline = Some(at);
        session.draft.proposals.clear();
        session.draft.default_proposal = None;
        session.state = IntakeState::DeadlineConfirmed;
        let mut reply = self.ask_category(session);
        reply.text = format!("Deadline set: {}.\n\n{}", format_deadline(at), reply.text);
        reply
    }

    fn ask_category(&self, session: &mut IntakeSession) -> IntakeReply {
        session.state = IntakeState::TypeSelection;
        let suggested = session.draft.suggested_category.unwrap_or(Category::Other);
        let mut text = format!("What type of opportunity is this? Suggested: {suggested}\n");
        for (i, category) in Category::ALL.iter().enumerate() {
            text.push_str(&format!("\n{}. {category}", i + 1));
        }
        text.push_str("\n\nReply yes to accept the suggestion, or pick a number.");
        let actions = Category::ALL
            .iter()
            .enumerate()
            .map(|(i, c)| Action::new(c.to_string(), (i + 1).to_string()))
            .collect();
        IntakeReply::new(IntakeState::TypeSelection, text).with_actions(actions)
    }
}

fn yes_action() -> Action {
    Action::new("Yes", "yes")
}

fn manual_prompt(lead: &str) -> IntakeReply {
    IntakeReply::new(
        IntakeState::AwaitingManualDeadline,
        format!("{lead}\nSend the deadline, e.g. 2026-03-15, March 15 or in 2 weeks."),
    )
}

fn priority_prompt(lead: &str) -> IntakeReply {
    let text = format!(
        "{lead}\n\nPriority?\n\n1. High (reminders 14, 7, 3, 2 and 1 days before, and on the day)\n\
         2. Medium (7, 3 and 1 days before, and on the day)\n3. Low (same as medium)\n\n\
         Reply yes for Medium."
    );
    let actions = Priority::ALL
        .iter()
        .enumerate()
        .map(|(i, p)| Action::new(p.to_string(), (i + 1).to_string()))
        .collect();
    IntakeReply::new(IntakeState::PrioritySelection, text).with_actions(actions)
}

fn title_prompt(session: &IntakeSession, lead: &str) -> IntakeReply {
    IntakeReply::new(
        IntakeState::TitleConfirmation,
        format!(
            "{lead}\n\nSuggested title: {}\nReply yes to use it, or send a different title.",
            session.draft.suggested_title
        ),
    )
    .with_actions(vec![yes_action()])
}

fn saved_text(opp: &Opportunity, reminders: &[Reminder], now: DateTime<Utc>) -> String {
    let mut text = format!(
        "Saved: {}\nType: {}\nPriority: {}\nDeadline: {} ({} left)\nId: {}\n",
        opp.title,
        opp.category,
        opp.priority,
        format_deadline(opp.deadline),
        format_countdown(opp.deadline, now),
        opp.short_id()
    );
    if reminders.is_empty() {
        text.push_str("\nNo reminders left before the deadline.");
    } else {
        text.push_str("\nReminders:");
        for r in reminders {
            text.push_str(&format!("\n- {}: {}", r.kind.describe(), format_deadline(r.fire_at)));
        }
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteStorage;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap()
    }

    fn engine() -> (Arc<SqliteStorage>, IntakeEngine<SqliteStorage>) {
        let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
        let engine = IntakeEngine::new(Arc::clone(&storage), &OppTickConfig::default_config());
        (storage, engine)
    }

    fn msg(text: &str, minutes: i64) -> InboundMessage {
        InboundMessage::new("alice", "chat-1", text, now() + Duration::minutes(minutes))
    }

    async fn say(engine: &IntakeEngine<SqliteStorage>, text: &str) -> IntakeReply {
        engine.handle(&msg(text, 0)).await.unwrap()
    }

    #[test]
    fn reply_parsing() {
        assert_eq!(Reply::parse(" Yes "), Reply::Affirm);
        assert_eq!(Reply::parse("ok."), Reply::Affirm);
        assert_eq!(Reply::parse("manual"), Reply::Reject);
        assert_eq!(Reply::parse("/cancel"), Reply::Cancel);
        assert_eq!(Reply::parse("2"), Reply::Choice(2));
        assert_eq!(Reply::parse("0"), Reply::Text("0".into()));
        assert_eq!(Reply::parse("High"), Reply::Text("High".into()));
    }

    #[tokio::test]
    async fn full_dialog_saves_with_timetable() {
        let (storage, engine) = engine();

        let r = say(&engine, "Google internship program. Apply by 2026-03-20").await;
        assert_eq!(r.state, IntakeState::DeadlineProposed);
        assert!(r.text.contains("2026-03-20 23:59 UTC"));

        let r = say(&engine, "yes").await;
        assert_eq!(r.state, IntakeState::TypeSelection);
        assert!(r.text.contains("Suggested: Internship"));

        let r = say(&engine, "yes").await;
        assert_eq!(r.state, IntakeState::PrioritySelection);

        let r = say(&engine, "1").await;
        assert_eq!(r.state, IntakeState::TitleConfirmation);

        let r = say(&engine, "Google SWE internship").await;
        assert_eq!(r.state, IntakeState::Saved);
        let id = r.opportunity_id.unwrap();

        let opp = storage.get_opportunity(id).await.unwrap();
        assert_eq!(opp.title, "Google SWE internship");
        assert_eq!(opp.category, Category::Internship);
        assert_eq!(opp.priority, Priority::High);
        assert_eq!(opp.conversation_id, "chat-1");
        assert_eq!(storage.list_reminders(id, true).await.unwrap().len(), 6);

        assert!(storage.get_session("alice", "chat-1").await.unwrap().is_none());
        assert!(storage.get_settings("alice").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn no_date_asks_for_manual_entry() {
        let (_, engine) = engine();
        let r = say(&engine, "Cool hackathon, sign up soon").await;
        assert_eq!(r.state, IntakeState::AwaitingManualDeadline);

        let r = say(&engine, "whenever").await;
        assert_eq!(r.state, IntakeState::AwaitingManualDeadline);

        let r = say(&engine, "2020-01-01").await;
        assert_eq!(r.state, IntakeState::AwaitingManualDeadline);
        assert!(r.text.contains("past"));

        let r = say(&engine, "March 20, 2026").await;
        assert_eq!(r.state, IntakeState::TypeSelection);
        assert!(r.text.contains("Suggested: Event"));
    }

    #[tokio::test]
    async fn ambiguous_date_offers_choices() {
        let (storage, engine) = engine();
        let r = say(&engine, "Scholarship closes 03/04/2026").await;
        assert_eq!(r.state, IntakeState::DeadlineProposed);
        assert_eq!(r.actions.len(), 2);

        // No default to accept.
        let r = say(&engine, "yes").await;
        assert_eq!(r.state, IntakeState::DeadlineProposed);

        let r = say(&engine, "7").await;
        assert_eq!(r.state, IntakeState::DeadlineProposed);

        let r = say(&engine, "2").await;
        assert_eq!(r.state, IntakeState::TypeSelection);
        let session = storage.get_session("alice", "chat-1").await.unwrap().unwrap();
        assert!(session.draft.deadline.is_some());
    }

    #[tokio::test]
    async fn rejecting_proposal_goes_manual() {
        let (_, engine) = engine();
        say(&engine, "Deadline 2026-03-20").await;
        let r = say(&engine, "no").await;
        assert_eq!(r.state, IntakeState::AwaitingManualDeadline);
        let r = say(&engine, "in 2 weeks").await;
        assert_eq!(r.state, IntakeState::TypeSelection);
    }

    #[tokio::test]
    async fn invalid_selections_stay_put() {
        let (_, engine) = engine();
        say(&engine, "Deadline 2026-03-20").await;
        say(&engine, "yes").await;

        let r = say(&engine, "9").await;
        assert_eq!(r.state, IntakeState::TypeSelection);
        let r = say(&engine, "scholarship").await;
        assert_eq!(r.state, IntakeState::PrioritySelection);
        let r = say(&engine, "urgent").await;
        assert_eq!(r.state, IntakeState::PrioritySelection);
        let r = say(&engine, "low").await;
        assert_eq!(r.state, IntakeState::TitleConfirmation);
    }

    #[tokio::test]
    async fn cancel_discards_session() {
        let (storage, engine) = engine();
        say(&engine, "Deadline 2026-03-20").await;
        let r = say(&engine, "cancel").await;
        assert_eq!(r.state, IntakeState::AwaitingForward);
        assert!(storage.get_session("alice", "chat-1").await.unwrap().is_none());
        assert_eq!(storage.stats(Some("alice")).await.unwrap().opportunities, 0);

        let r = say(&engine, "/cancel").await;
        assert_eq!(r.text, "Nothing to cancel.");
    }

    #[tokio::test]
    async fn expired_session_restarts_fresh() {
        let (storage, engine) = engine();
        engine.handle(&msg("Deadline 2026-03-20", 0)).await.unwrap();
        engine.handle(&msg("yes", 1)).await.unwrap();

        // Default idle window is 30 minutes.
        let r = engine.handle(&msg("yes", 40)).await.unwrap();
        assert_eq!(r.state, IntakeState::AwaitingManualDeadline);
        let session = storage.get_session("alice", "chat-1").await.unwrap().unwrap();
        assert_eq!(session.draft.source_text, "yes");
    }

    #[tokio::test]
    async fn empty_text_creates_no_session() {
        let (storage, engine) = engine();
        let r = say(&engine, "   ").await;
        assert_eq!(r.state, IntakeState::AwaitingForward);
        assert!(storage.get_session("alice", "chat-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn conversations_are_independent() {
        let (storage, engine) = engine();
        say(&engine, "Deadline 2026-03-20").await;
        let other = InboundMessage::new("alice", "chat-2", "no date here", now());
        let r = engine.handle(&other).await.unwrap();
        assert_eq!(r.state, IntakeState::AwaitingManualDeadline);

        let first = storage.get_session("alice", "chat-1").await.unwrap().unwrap();
        assert_eq!(first.state, IntakeState::DeadlineProposed);
    }

    #[tokio::test]
    async fn purge_removes_only_expired() {
        let (_, engine) = engine();
        engine.handle(&msg("Deadline 2026-03-20", 0)).await.unwrap();
        assert_eq!(engine.purge_expired(now() + Duration::minutes(10)).await.unwrap(), 0);
        assert_eq!(engine.purge_expired(now() + Duration::hours(1)).await.unwrap(), 1);
    }
}
