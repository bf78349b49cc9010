//! Which scenes have been uploaded to which bulbs during this engine's life

use std::collections::HashSet;
use std::sync::Mutex;

use ilumi_proto::{Command, MacAddress, SceneId};

use crate::error::Error;

#[derive(Debug, Default)]
pub struct PatternBook {
    uploaded: Mutex<HashSet<(MacAddress, SceneId)>>,
}

impl PatternBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, address: MacAddress, scene: SceneId) {
        self.uploaded.lock().unwrap_or_else(|e| e.into_inner()).insert((address, scene));
    }

    pub fn contains(&self, address: MacAddress, scene: SceneId) -> bool {
        self.uploaded.lock().unwrap_or_else(|e| e.into_inner()).contains(&(address, scene))
    }

    /// Reject a batch that starts a scene neither uploaded before nor
    /// defined earlier in the same batch.
    pub fn check(&self, address: MacAddress, commands: &[Command]) -> Result<(), Error> {
        let mut defined = HashSet::new();
        for command in commands {
            match command {
                Command::DefinePattern(pattern) => {
                    defined.insert(pattern.scene());
                }
                Command::StartPattern { scene } => {
                    if !defined.contains(scene) && !self.contains(address, *scene) {
                        return Err(Error::PatternNotUploaded { address, scene: *scene });
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ilumi_proto::{Color, Pattern, PatternFrame};

    #[test]
    fn start_needs_an_upload() {
        let book = PatternBook::new();
        let addr = MacAddress([1, 2, 3, 4, 5, 6]);
        let pattern = Pattern::new(4, vec![PatternFrame::new(Color::off(), 10, 10)], 1).unwrap();

        assert!(matches!(
            book.check(addr, &[Command::StartPattern { scene: 4 }]),
            Err(Error::PatternNotUploaded { scene: 4, .. })
        ));
        book.check(addr, &[Command::DefinePattern(pattern), Command::StartPattern { scene: 4 }])
            .unwrap();

        book.record(addr, 4);
        book.check(addr, &[Command::StartPattern { scene: 4 }]).unwrap();
        assert!(!book.contains(MacAddress([9; 6]), 4));
    }
}
