//! Buzzer and status LED sequences.
//!
//! The [`Player`] is the single owner of the buzzer. Short feedback
//! sounds are dropped while a sequence plays, warnings queue behind it.

use heapless::Deque;

use crate::monitor::Led;

/// Buzzer tone.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Tone {
    /// Frequency in Hz.
    pub freq: u16,
    /// PWM duty in 0.1 %.
    pub duty: u16,
}

/// Status LED override of a step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LedCmd {
    Keep,
    Off,
    Show(Led),
}

/// One step of a sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Step {
    pub tone: Option<Tone>,
    pub led: LedCmd,
    /// Duration in milliseconds.
    pub ms: u32,
}

const fn tone(freq: u16, duty: u16, ms: u32) -> Step {
    Step { tone: Some(Tone { freq, duty }), led: LedCmd::Keep, ms }
}

const fn pause(ms: u32) -> Step {
    Step { tone: None, led: LedCmd::Keep, ms }
}

const fn lit(mut step: Step, led: LedCmd) -> Step {
    step.led = led;
    step
}

const BEEP: &[Step] = &[tone(1000, 20, 50)];

const ERROR: &[Step] = &[tone(200, 8, 200)];

const WELCOME: &[Step] = &[tone(1000, 20, 40), pause(80), tone(1500, 20, 70)];

const LOST_POWER: &[Step] = &[
    tone(3800, 500, 120),
    pause(100),
    tone(3800, 500, 250),
    pause(1000),
    tone(3800, 500, 120),
    pause(100),
    tone(3800, 500, 250),
    pause(1000),
    tone(3800, 500, 120),
    pause(100),
    tone(3800, 500, 250),
];

const LOST_BATTERY: &[Step] =
    &[tone(3800, 500, 370), pause(250), tone(3800, 500, 370), pause(250), tone(3800, 500, 370)];

const COUNTDOWN: &[Step] = &[
    lit(pause(800), LedCmd::Off),
    lit(tone(1000, 500, 200), LedCmd::Show(Led::Green)),
    lit(pause(1000), LedCmd::Off),
    lit(tone(1000, 500, 200), LedCmd::Show(Led::Green)),
    lit(pause(1000), LedCmd::Off),
    lit(tone(1000, 500, 200), LedCmd::Show(Led::Green)),
    lit(pause(1000), LedCmd::Off),
    lit(tone(1000, 500, 1500), LedCmd::Show(Led::Red)),
];

/// Sound sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Melody {
    Beep,
    Error,
    Welcome,
    LostPower,
    LostBattery,
    /// Three beeps with LED flashes followed by a long red tone before power is cut.
    Countdown,
}

impl Melody {
    pub fn steps(self) -> &'static [Step] {
        match self {
            Self::Beep => BEEP,
            Self::Error => ERROR,
            Self::Welcome => WELCOME,
            Self::LostPower => LOST_POWER,
            Self::LostBattery => LOST_BATTERY,
            Self::Countdown => COUNTDOWN,
        }
    }

    /// Whether the melody is skipped rather than queued while another plays.
    pub fn is_feedback(self) -> bool {
        matches!(self, Self::Beep | Self::Error)
    }

    /// Total duration in milliseconds.
    pub fn duration_ms(self) -> u32 {
        self.steps().iter().map(|s| s.ms).sum()
    }
}

/// Outcome of a play request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Request {
    /// Playback started with this step.
    Started(Step),
    Queued,
    Dropped,
}

/// Result of advancing playback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Advance {
    /// Output this step.
    Step(Step),
    /// Melody has finished, buzzer is to be silenced.
    Finished(Melody),
    Idle,
}

#[derive(Clone, Copy, Debug)]
struct Playing {
    melody: Melody,
    pos: usize,
    muted: bool,
}

impl Playing {
    fn step(&self) -> Step {
        let mut step = self.melody.steps()[self.pos];
        if self.muted {
            step.tone = None;
        }
        step
    }
}

/// Sequence player owning the buzzer.
#[derive(Default)]
pub struct Player {
    playing: Option<Playing>,
    queue: Deque<(Melody, bool), 4>,
}

impl Player {
    pub const fn new() -> Self {
        Self { playing: None, queue: Deque::new() }
    }

    /// Requests a melody. A muted melody still drives the LED.
    pub fn request(&mut self, melody: Melody, muted: bool) -> Request {
        if self.playing.is_none() {
            let playing = Playing { melody, pos: 0, muted };
            self.playing = Some(playing);
            return Request::Started(playing.step());
        }
        if melody.is_feedback() {
            return Request::Dropped;
        }
        // The countdown ends in a power cut and must never be lost.
        if melody == Melody::Countdown {
            self.queue.clear();
        }
        match self.queue.push_back((melody, muted)) {
            Ok(()) => Request::Queued,
            Err(_) => Request::Dropped,
        }
    }

    /// Moves to the next step after the current one has elapsed.
    pub fn advance(&mut self) -> Advance {
        let Some(playing) = self.playing.as_mut() else {
            return match self.queue.pop_front() {
                Some((melody, muted)) => {
                    let playing = Playing { melody, pos: 0, muted };
                    self.playing = Some(playing);
                    Advance::Step(playing.step())
                }
                None => Advance::Idle,
            };
        };
        if playing.pos + 1 < playing.melody.steps().len() {
            playing.pos += 1;
            return Advance::Step(playing.step());
        }
        let melody = playing.melody;
        self.playing = None;
        Advance::Finished(melody)
    }

    pub fn is_busy(&self) -> bool {
        self.playing.is_some()
    }

    /// Whether the current sequence controls the status LED.
    pub fn owns_led(&self) -> bool {
        matches!(self.playing, Some(Playing { melody: Melody::Countdown, .. }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn play_out(player: &mut Player) -> Vec<Step> {
        let mut steps = Vec::new();
        while let Advance::Step(step) = player.advance() {
            steps.push(step);
        }
        steps
    }

    #[test]
    fn feedback_dropped_while_busy() {
        let mut p = Player::new();
        assert!(matches!(p.request(Melody::LostPower, false), Request::Started(_)));
        assert_eq!(p.request(Melody::Beep, false), Request::Dropped);
        assert_eq!(p.request(Melody::Error, false), Request::Dropped);
        assert_eq!(p.request(Melody::LostBattery, false), Request::Queued);
    }

    #[test]
    fn warnings_play_in_order() {
        let mut p = Player::new();
        p.request(Melody::LostPower, false);
        p.request(Melody::LostBattery, false);
        let rest = play_out(&mut p);
        assert_eq!(rest.len(), LOST_POWER.len() - 1);
        assert_eq!(p.advance(), Advance::Step(LOST_BATTERY[0]));
        play_out(&mut p);
        assert_eq!(p.advance(), Advance::Idle);
        assert!(!p.is_busy());
    }

    #[test]
    fn queue_is_bounded() {
        let mut p = Player::new();
        p.request(Melody::Welcome, false);
        for _ in 0..4 {
            assert_eq!(p.request(Melody::LostBattery, false), Request::Queued);
        }
        assert_eq!(p.request(Melody::LostPower, false), Request::Dropped);
    }

    #[test]
    fn countdown_replaces_queue() {
        let mut p = Player::new();
        p.request(Melody::Welcome, false);
        for _ in 0..4 {
            p.request(Melody::LostBattery, false);
        }
        assert_eq!(p.request(Melody::Countdown, false), Request::Queued);
        play_out(&mut p);
        assert_eq!(p.advance(), Advance::Step(COUNTDOWN[0]));
    }

    #[test]
    fn finished_is_reported() {
        let mut p = Player::new();
        p.request(Melody::Beep, false);
        assert_eq!(p.advance(), Advance::Finished(Melody::Beep));
        assert_eq!(p.advance(), Advance::Idle);
    }

    #[test]
    fn muted_countdown_keeps_led() {
        let mut p = Player::new();
        let Request::Started(first) = p.request(Melody::Countdown, true) else { panic!("not started") };
        assert_eq!(first.led, LedCmd::Off);
        assert!(p.owns_led());
        let steps = play_out(&mut p);
        assert!(steps.iter().all(|s| s.tone.is_none()));
        assert_eq!(steps.last().map(|s| s.led), Some(LedCmd::Show(Led::Red)));
        assert_eq!(Melody::Countdown.duration_ms(), 800 + 3 * 1200 + 1500);
    }
}
