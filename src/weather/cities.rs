//! Immutable directory of known municipalities and their provider IDs.

use std::collections::BTreeMap;

use crate::config::CityEntry;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CityInfo {
    pub name: String,
    pub state: String,
    pub provider_id: Option<u64>,
}

impl CityInfo {
    /// `City-ST`, unique across states.
    pub fn label(&self) -> String {
        format!("{}-{}", self.name, self.state)
    }
}

/// How a location is addressed on the provider side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocationQuery {
    /// Provider city ID. Avoids ambiguous name matching.
    Id(u64),
    /// Free-text `city,state,country` query.
    Name(String),
}

/// Lookup from canonical city name and state to provider ID.
///
/// Municipalities sharing a name in different states are separate entries.
/// Built once at startup and shared read-only; tests build their own.
#[derive(Debug, Clone, Default)]
pub struct CityDirectory {
    by_key: BTreeMap<(String, String), CityInfo>,
}

impl CityDirectory {
    pub fn new(entries: impl IntoIterator<Item = CityInfo>) -> Self {
        let by_key = entries
            .into_iter()
            .map(|info| (canonical_key(&info.name, &info.state), info))
            .collect();
        Self { by_key }
    }

    pub fn from_config(entries: &[CityEntry]) -> Self {
        Self::new(entries.iter().map(|e| CityInfo {
            name: e.name.clone(),
            state: e.state.to_uppercase(),
            provider_id: e.provider_id,
        }))
    }

    pub fn get(&self, city: &str, state: &str) -> Option<&CityInfo> {
        self.by_key.get(&canonical_key(city, state))
    }

    /// Resolve a city to its provider query, preferring the known ID.
    pub fn resolve(&self, city: &str, state: &str, country: &str) -> LocationQuery {
        match self.get(city, state).and_then(|info| info.provider_id) {
            Some(id) => LocationQuery::Id(id),
            None => LocationQuery::Name(format!(
                "{},{},{}",
                city.trim(),
                state.trim().to_uppercase(),
                country
            )),
        }
    }

    /// Cities belonging to any of the given states, in directory order.
    pub fn tracked(&self, states: &[String]) -> Vec<CityInfo> {
        self.by_key
            .values()
            .filter(|info| states.iter().any(|s| s.eq_ignore_ascii_case(&info.state)))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

fn canonical_key(name: &str, state: &str) -> (String, String) {
    (name.trim().to_lowercase(), state.trim().to_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory() -> CityDirectory {
        CityDirectory::new(vec![
            CityInfo {
                name: "Rio de Janeiro".to_string(),
                state: "RJ".to_string(),
                provider_id: Some(3451190),
            },
            CityInfo {
                name: "Campinas".to_string(),
                state: "SP".to_string(),
                provider_id: Some(3467865),
            },
            CityInfo {
                name: "Recife".to_string(),
                state: "PE".to_string(),
                provider_id: Some(3390760),
            },
        ])
    }

    #[test]
    fn test_resolve_prefers_known_id() {
        let dir = directory();
        assert_eq!(
            dir.resolve("rio de janeiro", "RJ", "BR"),
            LocationQuery::Id(3451190)
        );
    }

    #[test]
    fn test_resolve_unknown_city_uses_name_query() {
        let dir = directory();
        assert_eq!(
            dir.resolve("Volta Redonda", "rj", "BR"),
            LocationQuery::Name("Volta Redonda,RJ,BR".to_string())
        );
    }

    #[test]
    fn test_same_name_in_two_states_kept_apart() {
        let dir = CityDirectory::new(vec![
            CityInfo {
                name: "Bom Jesus".to_string(),
                state: "RJ".to_string(),
                provider_id: Some(1),
            },
            CityInfo {
                name: "Bom Jesus".to_string(),
                state: "SP".to_string(),
                provider_id: Some(2),
            },
        ]);

        assert_eq!(dir.len(), 2);
        assert_eq!(dir.resolve("Bom Jesus", "rj", "BR"), LocationQuery::Id(1));
        assert_eq!(dir.resolve("Bom Jesus", "SP", "BR"), LocationQuery::Id(2));
        assert_eq!(
            dir.resolve("Bom Jesus", "MG", "BR"),
            LocationQuery::Name("Bom Jesus,MG,BR".to_string())
        );

        let states: Vec<String> = dir
            .tracked(&["RJ".to_string(), "SP".to_string()])
            .into_iter()
            .map(|c| c.state)
            .collect();
        assert_eq!(states, vec!["RJ", "SP"]);
    }

    #[test]
    fn test_tracked_filters_by_state() {
        let dir = directory();
        let tracked = dir.tracked(&["SP".to_string(), "RJ".to_string()]);
        let names: Vec<&str> = tracked.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Campinas", "Rio de Janeiro"]);
    }
}
