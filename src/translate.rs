//! Controller → amp translation rules
//!
//! Maps the POD's volume and expression controls onto the Katana's CC
//! numbers, forces full volume ahead of patch changes, and suppresses
//! repeated CCs caused by pedal jitter. The decoded event is never modified;
//! every rule produces a new message.

use tracing::trace;

use crate::config::{ExpressionScaling, TranslationConfig};
use crate::midi::{MidiEvent, MidiMessage};

/// What the dispatcher should do with one event on the amp side
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AmpPlan {
    /// Send these messages to the amp, in order
    Send(Vec<MidiMessage>),
    /// Same control and value as the last message sent; send nothing
    Duplicate(MidiMessage),
}

/// Stateful translator owned by the dispatcher
///
/// Holds the last message forwarded to the amp, which is only used for
/// duplicate suppression.
pub struct Translator {
    policy: TranslationConfig,
    last_sent: Option<MidiMessage>,
}

impl Translator {
    pub fn new(policy: TranslationConfig) -> Self {
        Self {
            policy,
            last_sent: None,
        }
    }

    /// Map a controller message to the message the amp expects
    pub fn translate(&self, message: &MidiMessage) -> MidiMessage {
        match *message {
            MidiMessage::ControlChange { channel, cc, value } if cc == self.policy.volume_cc.from => {
                MidiMessage::ControlChange {
                    channel,
                    cc: self.policy.volume_cc.to,
                    value,
                }
            }
            MidiMessage::ControlChange { channel, cc, value } if cc == self.policy.expression_cc.from => {
                MidiMessage::ControlChange {
                    channel,
                    cc: self.policy.expression_cc.to,
                    value: scale_expression(self.policy.expression_scaling, value),
                }
            }
            ref other => other.clone(),
        }
    }

    /// Decide what goes to the amp for `event`
    ///
    /// Does not record anything; call [`Translator::mark_sent`] once the
    /// messages have actually been delivered.
    pub fn plan(&self, event: &MidiEvent) -> AmpPlan {
        let mapped = self.translate(&event.message);

        match mapped {
            MidiMessage::ControlChange { .. } => {
                if self.policy.deduplicate && self.is_duplicate(&mapped) {
                    return AmpPlan::Duplicate(mapped);
                }
                AmpPlan::Send(vec![mapped])
            }
            MidiMessage::ProgramChange { channel, .. } if self.policy.volume_reset_on_program_change => {
                let reset = MidiMessage::ControlChange {
                    channel,
                    cc: self.policy.volume_cc.to,
                    value: self.policy.volume_reset_value,
                };
                AmpPlan::Send(vec![reset, mapped])
            }
            other => AmpPlan::Send(vec![other]),
        }
    }

    fn is_duplicate(&self, mapped: &MidiMessage) -> bool {
        match (&self.last_sent, mapped) {
            (
                Some(MidiMessage::ControlChange { cc: last_cc, value: last_value, .. }),
                MidiMessage::ControlChange { cc, value, .. },
            ) => last_cc == cc && last_value == value,
            _ => false,
        }
    }

    /// Record the message most recently forwarded to the amp
    pub fn mark_sent(&mut self, message: MidiMessage) {
        trace!("Last sent: {}", message);
        self.last_sent = Some(message);
    }

    /// Forget the last sent message (after a reconnect)
    pub fn clear(&mut self) {
        self.last_sent = None;
    }

    pub fn last_sent(&self) -> Option<&MidiMessage> {
        self.last_sent.as_ref()
    }
}

/// Apply the expression pedal scaling policy
///
/// `Halve` is `round(v / 2)` with ties going to the even neighbour:
/// 1 → 0, 3 → 2, 127 → 64.
pub fn scale_expression(scaling: ExpressionScaling, value: u8) -> u8 {
    match scaling {
        ExpressionScaling::Identity => value,
        ExpressionScaling::Halve => {
            let half = value / 2;
            if value % 2 == 1 && half % 2 == 1 {
                half + 1
            } else {
                half
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn cc(channel: u8, cc: u8, value: u8) -> MidiMessage {
        MidiMessage::ControlChange { channel, cc, value }
    }

    fn event(message: MidiMessage) -> MidiEvent {
        MidiEvent::from_message(message)
    }

    fn translator() -> Translator {
        Translator::new(TranslationConfig::default())
    }

    #[test]
    fn test_volume_remap() {
        let t = translator();
        assert_eq!(t.translate(&cc(0, 7, 100)), cc(0, 81, 100));
    }

    #[test]
    fn test_expression_remap_and_halve() {
        let t = translator();
        assert_eq!(t.translate(&cc(0, 4, 0)), cc(0, 80, 0));
        assert_eq!(t.translate(&cc(0, 4, 1)), cc(0, 80, 0));
        assert_eq!(t.translate(&cc(0, 4, 3)), cc(0, 80, 2));
        assert_eq!(t.translate(&cc(0, 4, 64)), cc(0, 80, 32));
        assert_eq!(t.translate(&cc(0, 4, 127)), cc(0, 80, 64));
    }

    #[test]
    fn test_expression_without_scaling() {
        let t = Translator::new(TranslationConfig {
            expression_scaling: ExpressionScaling::Identity,
            ..TranslationConfig::default()
        });
        assert_eq!(t.translate(&cc(2, 4, 127)), cc(2, 80, 127));
    }

    #[test]
    fn test_unmapped_messages_pass_through() {
        let t = translator();
        let note = MidiMessage::NoteOn { channel: 0, note: 60, velocity: 90 };
        assert_eq!(t.translate(&note), note);
        assert_eq!(t.translate(&cc(0, 11, 5)), cc(0, 11, 5));
    }

    #[test]
    fn test_translate_leaves_event_untouched() {
        let t = translator();
        let original = event(cc(0, 4, 100));
        let copy = original.clone();

        let _ = t.plan(&original);
        assert_eq!(original, copy);
        assert_eq!(original.raw, vec![0xB0, 4, 100]);
    }

    #[test]
    fn test_duplicate_after_mapping() {
        let mut t = translator();

        let first = t.plan(&event(cc(0, 4, 100)));
        assert_eq!(first, AmpPlan::Send(vec![cc(0, 80, 50)]));
        t.mark_sent(cc(0, 80, 50));

        // 101 halves to 50 as well
        assert_eq!(t.plan(&event(cc(0, 4, 101))), AmpPlan::Duplicate(cc(0, 80, 50)));
        assert_eq!(t.plan(&event(cc(0, 4, 104))), AmpPlan::Send(vec![cc(0, 80, 52)]));
    }

    #[test]
    fn test_duplicate_ignores_channel() {
        let mut t = translator();
        t.mark_sent(cc(0, 81, 64));
        assert_eq!(t.plan(&event(cc(5, 7, 64))), AmpPlan::Duplicate(cc(5, 81, 64)));
    }

    #[test]
    fn test_deduplicate_can_be_disabled() {
        let mut t = Translator::new(TranslationConfig {
            deduplicate: false,
            ..TranslationConfig::default()
        });
        t.mark_sent(cc(0, 81, 10));
        assert_eq!(t.plan(&event(cc(0, 7, 10))), AmpPlan::Send(vec![cc(0, 81, 10)]));
    }

    #[test]
    fn test_program_change_forces_full_volume_first() {
        let t = translator();
        let pc = MidiMessage::ProgramChange { channel: 3, program: 9 };

        assert_eq!(
            t.plan(&event(pc.clone())),
            AmpPlan::Send(vec![cc(3, 81, 127), pc])
        );
    }

    #[test]
    fn test_program_change_is_never_a_duplicate() {
        let mut t = translator();
        let pc = MidiMessage::ProgramChange { channel: 0, program: 1 };
        t.mark_sent(pc.clone());
        assert!(matches!(t.plan(&event(pc)), AmpPlan::Send(_)));
    }

    #[test]
    fn test_clear_forgets_last_sent() {
        let mut t = translator();
        t.mark_sent(cc(0, 81, 3));
        t.clear();
        assert!(t.last_sent().is_none());
        assert_eq!(t.plan(&event(cc(0, 7, 3))), AmpPlan::Send(vec![cc(0, 81, 3)]));
    }

    proptest! {
        #[test]
        fn prop_volume_keeps_value(channel in 0u8..16, value in 0u8..128) {
            prop_assert_eq!(translator().translate(&cc(channel, 7, value)), cc(channel, 81, value));
        }

        #[test]
        fn prop_expression_halves(value in 0u8..128) {
            let expected = scale_expression(ExpressionScaling::Halve, value);
            prop_assert_eq!(translator().translate(&cc(0, 4, value)), cc(0, 80, expected));
            prop_assert!(expected <= 64);
            // Within half a step of v/2
            prop_assert!((expected as f32 - value as f32 / 2.0).abs() <= 0.5);
        }
    }
}
