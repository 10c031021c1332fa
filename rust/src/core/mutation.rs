// Optimistic apply -> remote submit -> commit or compare-and-revert.

use flume::Sender;

use super::overlay::{FieldValue, OverlayEntry, OverlayField, Revert};
use super::{InFlight, ReactionCore};
use crate::error::ReactionError;
use crate::state::{ReactionKind, TargetKey};
use crate::store::StoreError;
use crate::updates::{CoreMsg, InternalEvent};

/// Where the outcome of a mutation goes once it settles.
#[derive(Debug)]
pub(crate) enum Reply {
    /// Fire-and-forget (FFI dispatch); failures surface as `MutationFailed` updates only.
    Detached,
    Toggle(Sender<Result<(), ReactionError>>),
    Rate(Sender<Result<bool, ReactionError>>),
}

impl Reply {
    pub(super) fn resolve(self, outcome: Result<bool, ReactionError>) {
        match self {
            Reply::Detached => {}
            Reply::Toggle(tx) => {
                let _ = tx.send(outcome.map(|_| ()));
            }
            Reply::Rate(tx) => {
                let _ = tx.send(outcome);
            }
        }
    }
}

#[derive(Debug, Clone)]
enum Submit {
    Toggle {
        kind: ReactionKind,
        emoji: Option<String>,
    },
    Rate(u8),
    ClearRating,
}

impl ReactionCore {
    pub(crate) fn toggle(
        &mut self,
        target: &TargetKey,
        kind: ReactionKind,
        reply: Reply,
    ) -> Result<(), ReactionError> {
        if !kind.is_flag() {
            return Err(ReactionError::UnsupportedToggle(kind));
        }
        let field = OverlayField::Flag(kind);
        let current = self.effective_field(target, &field)?;
        let FieldValue::Flag(on) = current else {
            return Err(ReactionError::UnsupportedToggle(kind));
        };
        self.begin_mutation(
            target,
            field,
            FieldValue::Flag(!on),
            Submit::Toggle { kind, emoji: None },
            "Toggle",
            reply,
        )
    }

    pub(crate) fn toggle_emoji(
        &mut self,
        target: &TargetKey,
        emoji: &str,
        reply: Reply,
    ) -> Result<(), ReactionError> {
        let emoji = emoji.trim();
        if emoji.is_empty() || emoji.len() > self.max_emoji_bytes() {
            return Err(ReactionError::InvalidEmoji(emoji.to_string()));
        }
        let field = OverlayField::Emoji(emoji.to_string());
        let current = self.effective_field(target, &field)?;
        let FieldValue::Flag(on) = current else {
            return Err(ReactionError::InvalidEmoji(emoji.to_string()));
        };
        self.begin_mutation(
            target,
            field,
            FieldValue::Flag(!on),
            Submit::Toggle {
                kind: ReactionKind::Emoji,
                emoji: Some(emoji.to_string()),
            },
            "ToggleEmoji",
            reply,
        )
    }

    pub(crate) fn rate(
        &mut self,
        target: &TargetKey,
        value: u8,
        reply: Reply,
    ) -> Result<(), ReactionError> {
        if !(1..=5).contains(&value) {
            return Err(ReactionError::InvalidRating(value));
        }
        self.effective_field(target, &OverlayField::Rating)?;
        self.begin_mutation(
            target,
            OverlayField::Rating,
            FieldValue::Rating(Some(value)),
            Submit::Rate(value),
            "Rate",
            reply,
        )
    }

    pub(crate) fn clear_rating(
        &mut self,
        target: &TargetKey,
        reply: Reply,
    ) -> Result<(), ReactionError> {
        self.effective_field(target, &OverlayField::Rating)?;
        self.begin_mutation(
            target,
            OverlayField::Rating,
            FieldValue::Rating(None),
            Submit::ClearRating,
            "ClearRating",
            reply,
        )
    }

    /// Boundary checks shared by every mutation, then the field's current effective value.
    fn effective_field(
        &self,
        target: &TargetKey,
        field: &OverlayField,
    ) -> Result<FieldValue, ReactionError> {
        if !self.authenticated {
            return Err(ReactionError::NotAuthenticated);
        }
        let cell = self
            .targets
            .get(target)
            .ok_or_else(|| ReactionError::UnknownTarget(target.clone()))?;
        let (_, effective) = cell.effective();
        Ok(field.read(&effective))
    }

    fn begin_mutation(
        &mut self,
        target: &TargetKey,
        field: OverlayField,
        value: FieldValue,
        submit: Submit,
        action: &'static str,
        reply: Reply,
    ) -> Result<(), ReactionError> {
        self.mutation_seq += 1;
        let seq = self.mutation_seq;
        self.next_tick();

        let cell = self
            .targets
            .get_mut(target)
            .ok_or_else(|| ReactionError::UnknownTarget(target.clone()))?;
        let previous = cell.overlay.write(field.clone(), value, seq);
        tracing::debug!(
            %target,
            seq,
            field = %field.label(),
            overlay_fields = cell.overlay.len(),
            "optimistic apply"
        );

        self.in_flight.insert(
            seq,
            InFlight {
                target: target.clone(),
                field,
                previous,
                action,
                reply,
            },
        );
        self.emit_target(target);
        self.spawn_submit(target.clone(), seq, submit);
        Ok(())
    }

    fn spawn_submit(&self, target: TargetKey, seq: u64, submit: Submit) {
        let store = self.store.clone();
        let tx = self.core_sender.clone();
        self.runtime.spawn_blocking(move || {
            let result = match &submit {
                Submit::Toggle { kind, emoji } => store
                    .submit_toggle(&target, *kind, emoji.as_deref())
                    .map(|()| true),
                Submit::Rate(value) => store.submit_rate(&target, *value),
                Submit::ClearRating => store.submit_clear_rating(&target),
            };
            let _ = tx.send(CoreMsg::Internal(Box::new(InternalEvent::SubmitSettled {
                seq,
                result,
            })));
        });
    }

    pub(super) fn handle_submit_settled(&mut self, seq: u64, result: Result<bool, StoreError>) {
        let Some(flight) = self.in_flight.remove(&seq) else {
            // Abandoned by a viewer change.
            tracing::debug!(seq, "ignoring settle for abandoned mutation");
            return;
        };
        let InFlight {
            target,
            field,
            previous,
            action,
            reply,
        } = flight;
        let tick = self.next_tick();

        match result {
            Ok(true) => {
                tracing::info!(%target, seq, action, "mutation committed");
                self.mark_settled(&target, &field, seq, tick);
                reply.resolve(Ok(true));
                self.refresh_after_commit(&target);
            }
            Ok(false) => {
                tracing::info!(%target, seq, action, "mutation not accepted, rolling back");
                self.roll_back(&target, &field, seq, previous);
                let err = ReactionError::Store(StoreError::Rejected("not accepted".into()));
                self.emit_mutation_failed(&target, action, &err);
                reply.resolve(Ok(false));
            }
            Err(e) => {
                tracing::warn!(%target, seq, action, %e, "mutation failed, rolling back");
                self.roll_back(&target, &field, seq, previous);
                let err = ReactionError::Store(e);
                self.emit_mutation_failed(&target, action, &err);
                reply.resolve(Err(err));
            }
        }

        if !self.evict_if_idle(&target) {
            self.emit_target(&target);
        }
    }

    fn mark_settled(&mut self, target: &TargetKey, field: &OverlayField, seq: u64, tick: u64) {
        if let Some(cell) = self.targets.get_mut(target) {
            cell.overlay.mark_settled(field, seq, tick);
        }
        // If a newer write already captured ours as its rollback point, that snapshot must
        // remember the write was accepted.
        for other in self.in_flight.values_mut() {
            if other.target == *target && other.field == *field {
                if let Some(prev) = other.previous.as_mut().filter(|p| p.seq == seq) {
                    prev.settled_at = Some(tick);
                }
            }
        }
    }

    fn roll_back(
        &mut self,
        target: &TargetKey,
        field: &OverlayField,
        seq: u64,
        previous: Option<OverlayEntry>,
    ) {
        let Some(cell) = self.targets.get_mut(target) else {
            return;
        };
        match cell.overlay.revert(field, seq, previous.clone()) {
            Revert::Restored => {}
            Revert::Superseded => {
                // A newer write owns the field. If it captured our doomed value as its
                // rollback point, hand it our own rollback point instead.
                for other in self.in_flight.values_mut() {
                    if other.target == *target
                        && other.field == *field
                        && other.previous.as_ref().map(|p| p.seq) == Some(seq)
                    {
                        other.previous = previous.clone();
                    }
                }
            }
        }
    }
}
