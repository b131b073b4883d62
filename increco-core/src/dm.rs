//! Inner dialogue-manager adapter contract (§4.5, §4.11). The *content* of
//! agenda-based, n-gram, and external dialogue managers is out of scope —
//! only this narrow `process_act`/`next_act` contract matters to the
//! turn-taking DM that drives them. [`ScriptedDialogueManager`] is the one
//! concrete, in-repo adapter: it plays back a fixed agenda of acts so the
//! turn-taking DM has a real, runnable collaborator without depending on an
//! external NLU/DM backend.

use std::collections::BTreeMap;

/// `process_act(act, concepts)`; `next_act() -> (act, concepts)` (§4.5).
pub trait DialogueManagerAdapter: Send {
    /// Informs the adapter of an act heard from the other side.
    fn process_act(&mut self, act: &str, concepts: &BTreeMap<String, String>);

    /// Produces the next act this side should perform.
    fn next_act(&mut self) -> (String, BTreeMap<String, String>);
}

/// Plays back a fixed sequence of acts, advancing one step per `next_act`
/// call and optionally reacting to specific heard acts by jumping to a named
/// step. Driven by a simple agenda list — grounded in the agenda-based DM's
/// externally visible contract only, never its agenda-file parsing (out of
/// scope).
pub struct ScriptedDialogueManager {
    agenda: Vec<(String, BTreeMap<String, String>)>,
    cursor: usize,
    heard: Vec<(String, BTreeMap<String, String>)>,
    reactions: BTreeMap<String, usize>,
}

impl ScriptedDialogueManager {
    pub fn new(agenda: Vec<(String, BTreeMap<String, String>)>) -> Self {
        ScriptedDialogueManager {
            agenda,
            cursor: 0,
            heard: Vec::new(),
            reactions: BTreeMap::new(),
        }
    }

    /// Registers a jump: when `on_act` is heard, the next call to
    /// `next_act` resumes from `agenda[step]` instead of the natural cursor.
    pub fn react_to(mut self, on_act: impl Into<String>, step: usize) -> Self {
        self.reactions.insert(on_act.into(), step);
        self
    }

    pub fn heard_acts(&self) -> &[(String, BTreeMap<String, String>)] {
        &self.heard
    }
}

impl DialogueManagerAdapter for ScriptedDialogueManager {
    fn process_act(&mut self, act: &str, concepts: &BTreeMap<String, String>) {
        self.heard.push((act.to_string(), concepts.clone()));
        if let Some(&step) = self.reactions.get(act) {
            self.cursor = step;
        }
    }

    fn next_act(&mut self) -> (String, BTreeMap<String, String>) {
        match self.agenda.get(self.cursor) {
            Some((act, concepts)) => {
                let result = (act.clone(), concepts.clone());
                self.cursor += 1;
                result
            }
            None => ("goodbye".to_string(), BTreeMap::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn act(name: &str) -> (String, BTreeMap<String, String>) {
        (name.to_string(), BTreeMap::new())
    }

    #[test]
    fn plays_back_agenda_in_order_then_says_goodbye() {
        let mut dm = ScriptedDialogueManager::new(vec![act("greeting"), act("provide_info")]);
        assert_eq!(dm.next_act().0, "greeting");
        assert_eq!(dm.next_act().0, "provide_info");
        assert_eq!(dm.next_act().0, "goodbye");
        assert_eq!(dm.next_act().0, "goodbye");
    }

    #[test]
    fn reaction_jumps_the_cursor() {
        let mut dm = ScriptedDialogueManager::new(vec![act("greeting"), act("provide_info"), act("goodbye")])
            .react_to("request_info", 2);
        assert_eq!(dm.next_act().0, "greeting");
        dm.process_act("request_info", &BTreeMap::new());
        assert_eq!(dm.next_act().0, "goodbye");
    }

    #[test]
    fn heard_acts_are_recorded() {
        let mut dm = ScriptedDialogueManager::new(vec![]);
        dm.process_act("confirm", &BTreeMap::new());
        assert_eq!(dm.heard_acts().len(), 1);
        assert_eq!(dm.heard_acts()[0].0, "confirm");
    }
}
