use std::io;
use std::path::Path;

use serde::Deserialize;

use crate::engine::{Engine, EngineError, NewEquipment};
use crate::model::{CalendarEvent, User};

/// Directory seed read from JSON at startup.
///
/// ```json
/// {
///   "users": [{ "id": "01J…", "name": "Ana", "tag": "04A1B2", "active": true }],
///   "equipment": [{ "id": "01J…", "name": "Camera A", "category": "camera", "tag": "E200" }],
///   "events": [{ "id": "01J…", "title": "Spring shoot" }]
/// }
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Seed {
    pub users: Vec<User>,
    pub equipment: Vec<NewEquipment>,
    pub events: Vec<CalendarEvent>,
}

/// How many records a seed run actually wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeedReport {
    pub users: usize,
    pub equipment: usize,
    pub events: usize,
}

impl Seed {
    pub fn load(path: &Path) -> io::Result<Self> {
        let bytes = std::fs::read(path)?;
        serde_json::from_slice(&bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Write whatever is missing or different. Running the same seed twice
    /// writes nothing the second time. Existing units are never touched.
    pub async fn apply(&self, engine: &Engine) -> Result<SeedReport, EngineError> {
        let mut report = SeedReport::default();
        for user in &self.users {
            if engine.get_user(user.id).as_ref() != Some(user) {
                engine.upsert_user(user.clone()).await?;
                report.users += 1;
            }
        }
        for event in &self.events {
            if !engine.calendar_event_exists(event.id) {
                engine.register_calendar_event(event.clone()).await?;
                report.events += 1;
            }
        }
        for unit in &self.equipment {
            match engine.register_equipment(unit.clone()).await {
                Ok(_) => report.equipment += 1,
                Err(EngineError::AlreadyExists(_)) => {}
                Err(e) => return Err(e),
            }
        }
        tracing::info!(
            users = report.users,
            equipment = report.equipment,
            events = report.events,
            "seed applied"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("kitroom_test_seed");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    const SEED: &str = r#"{
        "users": [{ "id": "01HZY3M4Q6R8T0V2X4Z6B8D0F2", "name": "Ana", "tag": "U-ANA", "active": true }],
        "equipment": [
            { "id": "01HZY3M4Q6R8T0V2X4Z6B8D0F3", "name": "Camera A", "category": "camera", "tag": "E-CAM-A" },
            { "id": "01HZY3M4Q6R8T0V2X4Z6B8D0F4", "name": "Tripod" }
        ],
        "events": [{ "id": "01HZY3M4Q6R8T0V2X4Z6B8D0F5", "title": "Spring shoot" }]
    }"#;

    #[test]
    fn parses_with_optional_fields() {
        let seed: Seed = serde_json::from_str(SEED).unwrap();
        assert_eq!(seed.users.len(), 1);
        assert_eq!(seed.equipment[1].tag, None);
        assert_eq!(seed.equipment[1].category, "");
        let empty: Seed = serde_json::from_str("{}").unwrap();
        assert!(empty.users.is_empty());
    }

    #[tokio::test]
    async fn applying_twice_writes_once() {
        let engine = Engine::new(test_wal_path("twice.wal"), Duration::from_secs(180)).unwrap();
        let seed: Seed = serde_json::from_str(SEED).unwrap();

        let first = seed.apply(&engine).await.unwrap();
        assert_eq!(
            first,
            SeedReport {
                users: 1,
                equipment: 2,
                events: 1
            }
        );
        let second = seed.apply(&engine).await.unwrap();
        assert_eq!(second, SeedReport::default());
        assert!(engine.find_by_tag("E-CAM-A").is_some());
    }

    #[test]
    fn load_reports_bad_json() {
        let path = test_wal_path("bad_seed.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = Seed::load(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
