//! Neighbour registry: every smart object this node can hear, ourself included.
//!
//! Entries are kept sorted by UID. The order is what makes speaker rotation
//! round-robin: the next speaker is always the next valid UID after the
//! current one, wrapping around.

use serde::Serialize;
use winenet_core::{AgencyUid, NeighbourState};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Neighbour {
    pub uid: AgencyUid,
    /// Set once a ping handshake has completed with this neighbour.
    pub valid: bool,
    /// Who this neighbour believes is the speaker.
    pub paired_speaker: Option<AgencyUid>,
    pub randnr: u32,
}

impl Neighbour {
    fn new(uid: AgencyUid) -> Self {
        Self {
            uid,
            valid: false,
            paired_speaker: None,
            randnr: 0,
        }
    }
}

#[derive(Debug)]
pub struct Registry {
    me: AgencyUid,
    list: Vec<Neighbour>,
    /// Rotation cursor: the speaker the last hand-off started from.
    current_speaker: Option<AgencyUid>,
}

impl Registry {
    /// Create a registry holding only ourself. The "ourself" entry is always
    /// valid and is never removed.
    pub fn new(me: AgencyUid, randnr: u32) -> Self {
        Self {
            me,
            list: vec![Neighbour {
                uid: me,
                valid: true,
                paired_speaker: None,
                randnr,
            }],
            current_speaker: None,
        }
    }

    pub fn me(&self) -> AgencyUid {
        self.me
    }

    /// Insert a new neighbour in UID order. Returns false if it was already known.
    pub fn add(&mut self, uid: AgencyUid) -> bool {
        match self.list.binary_search_by_key(&uid, |n| n.uid) {
            Ok(_) => false,
            Err(pos) => {
                self.list.insert(pos, Neighbour::new(uid));
                true
            }
        }
    }

    /// Remove a neighbour. Our pairing is cleared if it pointed at it; a
    /// rotation cursor on it moves back to its predecessor, so rotation goes
    /// on with the neighbour that followed it.
    pub fn remove(&mut self, uid: AgencyUid) -> Option<Neighbour> {
        if uid == self.me {
            return None;
        }
        let pos = self.list.binary_search_by_key(&uid, |n| n.uid).ok()?;
        let removed = self.list.remove(pos);

        if self.ourself().paired_speaker == Some(uid) {
            self.ourself_mut().paired_speaker = None;
        }
        if self.current_speaker == Some(uid) {
            let prev = (pos + self.list.len() - 1) % self.list.len();
            self.current_speaker = Some(self.list[prev].uid);
        }
        Some(removed)
    }

    /// Refresh what we know about a neighbour from the state carried in one
    /// of its beacons. Unknown senders are ignored.
    pub fn update_from_beacon(&mut self, uid: AgencyUid, state: &NeighbourState) {
        if uid == self.me {
            return;
        }
        if let Some(n) = self.find_mut(uid) {
            n.paired_speaker = state.paired_speaker;
            n.randnr = state.randnr;
        }
    }

    pub fn find(&self, uid: AgencyUid) -> Option<&Neighbour> {
        self.list
            .binary_search_by_key(&uid, |n| n.uid)
            .ok()
            .map(|pos| &self.list[pos])
    }

    pub fn find_mut(&mut self, uid: AgencyUid) -> Option<&mut Neighbour> {
        match self.list.binary_search_by_key(&uid, |n| n.uid) {
            Ok(pos) => Some(&mut self.list[pos]),
            Err(_) => None,
        }
    }

    pub fn is_valid(&self, uid: AgencyUid) -> bool {
        self.find(uid).is_some_and(|n| n.valid)
    }

    pub fn ourself(&self) -> &Neighbour {
        // The entry is inserted by `new` and `remove` refuses to drop it.
        self.find(self.me).unwrap_or(&self.list[0])
    }

    pub fn ourself_mut(&mut self) -> &mut Neighbour {
        let pos = self
            .list
            .binary_search_by_key(&self.me, |n| n.uid)
            .unwrap_or(0);
        &mut self.list[pos]
    }

    /// Next valid neighbour after `after`, wrapping around the list. Skips
    /// ourself and invalid entries. With `paired_with_us_only`, also skips
    /// neighbours that do not consider us their speaker. `None` starts from
    /// the head of the list.
    pub fn next_valid(
        &self,
        after: Option<AgencyUid>,
        paired_with_us_only: bool,
    ) -> Option<AgencyUid> {
        let len = self.list.len();
        let start = match after {
            None => 0,
            Some(uid) => match self.list.binary_search_by_key(&uid, |n| n.uid) {
                Ok(pos) => pos + 1,
                Err(pos) => pos,
            },
        };

        (0..len)
            .map(|i| &self.list[(start + i) % len])
            .find(|n| {
                n.uid != self.me
                    && n.valid
                    && (!paired_with_us_only || n.paired_speaker == Some(self.me))
            })
            .map(|n| n.uid)
    }

    pub fn first_valid(&self) -> Option<AgencyUid> {
        self.next_valid(None, false)
    }

    pub fn has_valid_neighbour(&self) -> bool {
        self.first_valid().is_some()
    }

    /// Valid neighbours other than ourself, in UID order.
    pub fn valid_uids(&self) -> Vec<AgencyUid> {
        let mut uids = Vec::new();
        self.for_each_valid(|n| uids.push(n.uid));
        uids
    }

    pub fn for_each_valid(&self, f: impl FnMut(&Neighbour)) {
        self.list
            .iter()
            .filter(|n| n.uid != self.me && n.valid)
            .for_each(f);
    }

    /// Mark a neighbour unreachable. It stays known and can be revived by a
    /// new ping handshake.
    pub fn invalidate(&mut self, uid: AgencyUid) {
        if uid == self.me {
            return;
        }
        if let Some(n) = self.find_mut(uid) {
            n.valid = false;
        }
    }

    pub fn current_speaker(&self) -> Option<AgencyUid> {
        self.current_speaker
    }

    pub fn set_current_speaker(&mut self, uid: Option<AgencyUid>) {
        self.current_speaker = uid;
    }

    pub fn iter(&self) -> impl Iterator<Item = &Neighbour> {
        self.list.iter()
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }
}
