use std::collections::HashSet;

/// One whisper/shout target slot, filled by a VoiceTarget message and
/// addressed by the 5-bit target field of audio packets.
#[derive(Default)]
pub struct VoiceTarget {
    pub sessions: HashSet<u32>,
    pub channels: HashSet<u32>,
}

impl VoiceTarget {
    pub fn clear(&mut self) {
        self.sessions.clear();
        self.channels.clear();
    }
}
