//! Interface table used to resolve the index carried in routing keys.

use pnet::datalink;

use crate::domain::InterfaceSnapshot;

#[derive(Debug, Clone, Default)]
pub struct Interfaces {
    list: Vec<InterfaceSnapshot>,
}

impl Interfaces {
    /// Snapshot the system's interfaces.
    pub fn discover() -> Self {
        datalink::interfaces()
            .iter()
            .map(InterfaceSnapshot::from)
            .collect()
    }

    pub fn find_by_index(&self, index: u32) -> Option<&InterfaceSnapshot> {
        self.list.iter().find(|ifp| ifp.index == index)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&InterfaceSnapshot> {
        self.list.iter().find(|ifp| ifp.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &InterfaceSnapshot> {
        self.list.iter()
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }
}

impl FromIterator<InterfaceSnapshot> for Interfaces {
    fn from_iter<I: IntoIterator<Item = InterfaceSnapshot>>(iter: I) -> Self {
        Self {
            list: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use macaddr::MacAddr6;

    #[test]
    fn test_lookup() {
        let interfaces: Interfaces = [
            InterfaceSnapshot::new("lo", 1, MacAddr6::nil()),
            InterfaceSnapshot::new("eth0", 2, MacAddr6::new(2, 0, 0, 0, 0, 1)),
        ]
        .into_iter()
        .collect();

        assert_eq!(interfaces.len(), 2);
        assert_eq!(interfaces.find_by_index(2).unwrap().name, "eth0");
        assert_eq!(interfaces.find_by_name("lo").unwrap().index, 1);
        assert!(interfaces.find_by_index(9).is_none());
        assert!(interfaces.find_by_name("wlan0").is_none());
    }

    #[test]
    fn test_discover_finds_loopback() {
        let interfaces = Interfaces::discover();
        assert!(interfaces.iter().any(|ifp| ifp.name == "lo"));
    }
}
