// Locally intended, not yet confirmed reaction changes for one target.
//
// Each field remembers which mutation wrote it. Rollback only touches a field the failing
// mutation still owns, so a late failure cannot undo a newer write.

use std::collections::BTreeMap;

use crate::model::UserReactionState;
use crate::state::ReactionKind;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum OverlayField {
    Flag(ReactionKind),
    Emoji(String),
    Rating,
}

impl OverlayField {
    pub(crate) fn label(&self) -> String {
        match self {
            Self::Flag(kind) => kind.as_str().to_string(),
            Self::Emoji(emoji) => format!("EMOJI:{emoji}"),
            Self::Rating => "RATING".to_string(),
        }
    }

    pub(crate) fn read(&self, state: &UserReactionState) -> FieldValue {
        match self {
            Self::Flag(kind) => FieldValue::Flag(state.flag(*kind)),
            Self::Emoji(emoji) => FieldValue::Flag(state.has_emoji(emoji)),
            Self::Rating => FieldValue::Rating(state.rating),
        }
    }

    fn write(&self, state: &mut UserReactionState, value: &FieldValue) {
        match (self, value) {
            (Self::Flag(kind), FieldValue::Flag(v)) => state.set_flag(*kind, *v),
            (Self::Emoji(emoji), FieldValue::Flag(true)) => {
                state.emojis.insert(emoji.clone());
            }
            (Self::Emoji(emoji), FieldValue::Flag(false)) => {
                state.emojis.remove(emoji);
            }
            (Self::Rating, FieldValue::Rating(v)) => state.rating = *v,
            // Mismatched pairs are never constructed by the orchestrator.
            _ => {}
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum FieldValue {
    Flag(bool),
    Rating(Option<u8>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct OverlayEntry {
    pub(crate) value: FieldValue,
    /// Sequence number of the mutation that wrote this value.
    pub(crate) seq: u64,
    /// Logical tick at which the write was accepted remotely.
    pub(crate) settled_at: Option<u64>,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Revert {
    /// The field still held this mutation's value and was restored.
    Restored,
    /// A newer mutation owns the field; nothing was touched.
    Superseded,
}

/// A field that was dropped because a fresh fetch disagreed with it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Contradiction {
    pub(crate) field: OverlayField,
    pub(crate) expected: FieldValue,
    pub(crate) fetched: FieldValue,
}

#[derive(Clone, Debug, Default)]
pub(crate) struct Overlay {
    fields: BTreeMap<OverlayField, OverlayEntry>,
}

impl Overlay {
    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.fields.len()
    }

    #[cfg(test)]
    pub(crate) fn get(&self, field: &OverlayField) -> Option<&OverlayEntry> {
        self.fields.get(field)
    }

    pub(crate) fn clear(&mut self) {
        self.fields.clear();
    }

    /// Overwrite `field` with `value` on behalf of mutation `seq`, returning the entry that was
    /// there before (the rollback snapshot).
    pub(crate) fn write(
        &mut self,
        field: OverlayField,
        value: FieldValue,
        seq: u64,
    ) -> Option<OverlayEntry> {
        self.fields.insert(
            field,
            OverlayEntry {
                value,
                seq,
                settled_at: None,
            },
        )
    }

    pub(crate) fn mark_settled(&mut self, field: &OverlayField, seq: u64, tick: u64) {
        if let Some(entry) = self.fields.get_mut(field) {
            if entry.seq == seq {
                entry.settled_at = Some(tick);
            }
        }
    }

    /// Compare-and-revert: restore `previous` only while `seq` still owns `field`.
    pub(crate) fn revert(
        &mut self,
        field: &OverlayField,
        seq: u64,
        previous: Option<OverlayEntry>,
    ) -> Revert {
        match self.fields.get(field) {
            Some(entry) if entry.seq == seq => {
                match previous {
                    Some(prev) => {
                        self.fields.insert(field.clone(), prev);
                    }
                    None => {
                        self.fields.remove(field);
                    }
                }
                Revert::Restored
            }
            _ => Revert::Superseded,
        }
    }

    /// Base user state with every overlay field applied on top.
    pub(crate) fn apply(&self, base: &UserReactionState) -> UserReactionState {
        let mut out = base.clone();
        for (field, entry) in &self.fields {
            field.write(&mut out, &entry.value);
        }
        out
    }

    /// Drop every field whose write settled before `issued_at`: a fetch issued after that point
    /// already reflects the write, so base is now the truth for it. Returns the fields where
    /// the fetched value contradicts what the overlay predicted.
    pub(crate) fn prune_settled(
        &mut self,
        fetched: &UserReactionState,
        issued_at: u64,
    ) -> Vec<Contradiction> {
        let mut contradictions = Vec::new();
        self.fields.retain(|field, entry| {
            let confirmed = matches!(entry.settled_at, Some(t) if t < issued_at);
            if !confirmed {
                return true;
            }
            let actual = field.read(fetched);
            if actual != entry.value {
                contradictions.push(Contradiction {
                    field: field.clone(),
                    expected: entry.value.clone(),
                    fetched: actual,
                });
            }
            false
        });
        contradictions
    }
}
