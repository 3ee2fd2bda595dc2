/// What a vote constrains.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum VoteKind {
    /// constant charge current, uA
    Ibat,
    /// input current limit, uA
    Ibus,
    /// constant charge voltage, uV
    Cccv,
}

impl VoteKind {
    const COUNT: usize = 3;
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Voter {
    ChargerType,
    Jeita,
    ThermalLimit,
    IrCompensation,
    UserChargeCurrent,
    UserInputLimit,
}

impl Voter {
    const COUNT: usize = 6;
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum VoteCmd {
    /// value is a ceiling
    Min,
    /// value is a floor
    Max,
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
struct Ballot {
    cmd: VoteCmd,
    value: i32,
}

/// Aggregates current/voltage requests from every policy into one value per
/// kind. Policies never touch actuators themselves, the owner of the sink
/// applies whatever `vote` reports as changed.
#[derive(Clone, Debug)]
pub struct VoteSink {
    ballots: [[Option<Ballot>; Voter::COUNT]; VoteKind::COUNT],
    resolved: [Option<i32>; VoteKind::COUNT],
}

impl VoteSink {
    pub const fn new() -> Self {
        Self {
            ballots: [[None; Voter::COUNT]; VoteKind::COUNT],
            resolved: [None; VoteKind::COUNT],
        }
    }

    /// Records the vote and returns the new resolved value if it changed.
    pub fn vote(&mut self, kind: VoteKind, voter: Voter, cmd: VoteCmd, value: i32) -> Option<i32> {
        self.ballots[kind as usize][voter as usize] = Some(Ballot { cmd, value });
        self.update(kind)
    }

    pub fn withdraw(&mut self, kind: VoteKind, voter: Voter) -> Option<i32> {
        self.ballots[kind as usize][voter as usize] = None;
        self.update(kind)
    }

    pub fn resolved(&self, kind: VoteKind) -> Option<i32> {
        self.resolved[kind as usize]
    }

    pub fn clear(&mut self) {
        *self = Self::new();
    }

    fn update(&mut self, kind: VoteKind) -> Option<i32> {
        let value = self.resolve(kind);
        if value == self.resolved[kind as usize] {
            return None;
        }

        debug!("vote {} resolved {}", kind, value);
        self.resolved[kind as usize] = value;
        value
    }

    // tightest ceiling, then raised to the highest floor
    fn resolve(&self, kind: VoteKind) -> Option<i32> {
        let ballots = self.ballots[kind as usize].iter().flatten();

        let ceiling = ballots.clone().filter(|b| b.cmd == VoteCmd::Min).map(|b| b.value).min();
        let floor = ballots.filter(|b| b.cmd == VoteCmd::Max).map(|b| b.value).max();

        match (ceiling, floor) {
            (Some(c), Some(f)) => Some(c.max(f)),
            (c, f) => c.or(f),
        }
    }
}

impl Default for VoteSink {
    fn default() -> Self {
        Self::new()
    }
}

/////////////
//  TESTS  //
/////////////

#[test]
fn min_votes_take_tightest() {
    let mut sink = VoteSink::new();
    assert_eq!(Some(2_000_000), sink.vote(VoteKind::Ibat, Voter::ChargerType, VoteCmd::Min, 2_000_000));
    assert_eq!(Some(1_000_000), sink.vote(VoteKind::Ibat, Voter::Jeita, VoteCmd::Min, 1_000_000));
    // looser ceiling doesn't move the result, nothing to apply
    assert_eq!(None, sink.vote(VoteKind::Ibat, Voter::ThermalLimit, VoteCmd::Min, 1_500_000));
    assert_eq!(Some(1_000_000), sink.resolved(VoteKind::Ibat));

    assert_eq!(Some(1_500_000), sink.withdraw(VoteKind::Ibat, Voter::Jeita));
}

#[test]
fn max_vote_raises_floor() {
    let mut sink = VoteSink::new();
    sink.vote(VoteKind::Cccv, Voter::Jeita, VoteCmd::Min, 4_350_000);
    assert_eq!(Some(4_400_000), sink.vote(VoteKind::Cccv, Voter::IrCompensation, VoteCmd::Max, 4_400_000));
    assert_eq!(Some(4_350_000), sink.vote(VoteKind::Cccv, Voter::IrCompensation, VoteCmd::Max, 4_300_000));
}

#[test]
fn kinds_are_independent() {
    let mut sink = VoteSink::new();
    sink.vote(VoteKind::Ibus, Voter::ChargerType, VoteCmd::Min, 500_000);
    assert_eq!(None, sink.resolved(VoteKind::Ibat));
    sink.clear();
    assert_eq!(None, sink.resolved(VoteKind::Ibus));
}
