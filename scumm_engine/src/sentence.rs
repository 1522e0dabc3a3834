use serde::Serialize;

use crate::config::SentencePolicy;
use crate::dispatch::OpcodeDispatcher;
use crate::error::{Result, VmError};
use crate::vm::Vm;

/// Verb value that clears the queue instead of enqueueing.
pub const STOP_SENTENCE_VERB: u16 = 0xFE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Sentence {
    pub verb: u16,
    pub object_a: u16,
    pub object_b: u16,
    pub freeze_count: u32,
}

/// Pending player commands. Executed last-in first-out.
#[derive(Debug, Clone)]
pub struct SentenceQueue {
    entries: Vec<Sentence>,
    capacity: usize,
    policy: SentencePolicy,
}

impl SentenceQueue {
    pub fn new(capacity: usize, policy: SentencePolicy) -> Self {
        SentenceQueue {
            entries: Vec::with_capacity(capacity),
            capacity,
            policy,
        }
    }

    /// Queues a sentence. Returns false when the coalescing policy dropped
    /// it as a self-reference or an immediate repeat.
    pub fn enqueue(&mut self, verb: u16, object_a: u16, object_b: u16) -> Result<bool> {
        if self.policy == SentencePolicy::Coalesce {
            if object_a == object_b {
                return Ok(false);
            }
            let repeat = self.entries.last().is_some_and(|last| {
                last.verb == verb && last.object_a == object_a && last.object_b == object_b
            });
            if repeat {
                return Ok(false);
            }
        }
        if self.entries.len() >= self.capacity {
            return Err(VmError::SentenceOverflow {
                capacity: self.capacity,
            });
        }
        self.entries.push(Sentence {
            verb,
            object_a,
            object_b,
            freeze_count: 0,
        });
        Ok(true)
    }

    /// Takes the newest sentence unless it is frozen.
    pub fn pop_ready(&mut self) -> Option<Sentence> {
        if self.entries.last()?.freeze_count > 0 {
            return None;
        }
        self.entries.pop()
    }

    pub fn freeze_all(&mut self) {
        for sentence in &mut self.entries {
            sentence.freeze_count += 1;
        }
    }

    pub fn unfreeze_all(&mut self) {
        for sentence in &mut self.entries {
            sentence.freeze_count = sentence.freeze_count.saturating_sub(1);
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Sentence> {
        self.entries.iter()
    }
}

impl Vm {
    /// Queues a player command. [`STOP_SENTENCE_VERB`] clears the queue and
    /// stops the sentence script instead.
    pub fn enqueue_sentence(&mut self, verb: u16, object_a: u16, object_b: u16) -> Result<bool> {
        if verb == STOP_SENTENCE_VERB {
            self.stop_sentences()?;
            return Ok(false);
        }
        let queued = self.sentences.enqueue(verb, object_a, object_b)?;
        if queued {
            self.log_event(format!("sentence.queue {verb} {object_a} {object_b}"));
        }
        Ok(queued)
    }

    pub fn stop_sentences(&mut self) -> Result<()> {
        self.sentences.clear();
        let script = self.well_known(self.config.well_known.sentence_script)?;
        if script > 0 {
            self.stop_script(script as u16)?;
        }
        self.log_event("sentence.clear");
        Ok(())
    }

    /// Starts the sentence script for the newest ready sentence, unless the
    /// script is already busy with a previous one. Returns whether a
    /// sentence ran.
    pub fn tick_sentences(&mut self, dispatcher: &mut dyn OpcodeDispatcher) -> Result<bool> {
        let script = self.well_known(self.config.well_known.sentence_script)?;
        if script <= 0 {
            return Ok(false);
        }
        let script = script as u16;
        let busy = self
            .slots
            .iter()
            .any(|(_, slot)| slot.is_live() && slot.number == script && !slot.is_frozen());
        if busy {
            return Ok(false);
        }
        let Some(sentence) = self.sentences.pop_ready() else {
            return Ok(false);
        };
        if self.config.sentence_policy == SentencePolicy::Legacy
            && sentence.object_b != 0
            && sentence.object_b == sentence.object_a
        {
            self.log_event(format!(
                "sentence.skip {} {} {}",
                sentence.verb, sentence.object_a, sentence.object_b
            ));
            return Ok(false);
        }

        self.log_event(format!(
            "sentence.run {} {} {}",
            sentence.verb, sentence.object_a, sentence.object_b
        ));
        self.active = None;
        self.cursor.detach();
        let locals = [
            sentence.verb as i16,
            sentence.object_a as i16,
            sentence.object_b as i16,
        ];
        self.run_script(dispatcher, script, false, false, &locals)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coalescing_drops_repeats_and_self_references() {
        let mut queue = SentenceQueue::new(4, SentencePolicy::Coalesce);
        assert!(queue.enqueue(3, 10, 0).unwrap());
        assert!(!queue.enqueue(3, 10, 0).unwrap());
        assert!(!queue.enqueue(4, 11, 11).unwrap());
        assert!(queue.enqueue(4, 10, 0).unwrap());
        assert!(queue.enqueue(3, 10, 0).unwrap());
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn legacy_queues_everything_until_full() {
        let mut queue = SentenceQueue::new(2, SentencePolicy::Legacy);
        assert!(queue.enqueue(3, 10, 0).unwrap());
        assert!(queue.enqueue(3, 10, 0).unwrap());
        assert!(matches!(
            queue.enqueue(3, 10, 0),
            Err(VmError::SentenceOverflow { capacity: 2 })
        ));
    }

    #[test]
    fn newest_sentence_wins_and_frozen_top_blocks() {
        let mut queue = SentenceQueue::new(4, SentencePolicy::Legacy);
        queue.enqueue(1, 1, 0).unwrap();
        queue.freeze_all();
        queue.enqueue(2, 2, 0).unwrap();

        assert_eq!(queue.pop_ready().map(|s| s.verb), Some(2));
        assert_eq!(queue.pop_ready(), None);
        assert_eq!(queue.len(), 1);
        queue.unfreeze_all();
        assert_eq!(queue.pop_ready().map(|s| s.verb), Some(1));
        assert!(queue.is_empty());
    }
}
