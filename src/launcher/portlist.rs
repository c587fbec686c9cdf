use std::net::TcpListener;

/// An inclusive range of TCP ports, as written in a port specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PortRange {
    start: u16,
    end: u16,
}

/// An ordered collection of port ranges used to allocate debugging and
/// profiling ports.
///
/// Ranges keep their specification order and are consumed front to back:
/// `get_next` pops the lowest port of the first range and drops the range
/// once it is exhausted, so repeated calls enumerate every port exactly
/// once, ascending within each range.
#[derive(Debug, Clone, Default)]
pub struct PortList {
    ranges: Vec<PortRange>,
}

/// Grammar: Spec -> [ ElemList ]
///          ElemList -> Elem [ ',' ElemList ]
///          Elem -> Port [ '-' Port ]
struct SpecParser<'a> {
    bytes: &'a [u8],
    pos: usize,
    list: PortList,
}

impl<'a> SpecParser<'a> {
    fn new(spec: &'a str) -> Self {
        Self {
            bytes: spec.as_bytes(),
            pos: 0,
            list: PortList::default(),
        }
    }

    fn parse(mut self) -> Result<PortList, &'static str> {
        if !self.at_end() {
            self.parse_elem_list()?;
        }
        Ok(self.list)
    }

    fn parse_elem_list(&mut self) -> Result<(), &'static str> {
        loop {
            self.parse_elem()?;
            if self.at_end() {
                return Ok(());
            }
            if self.next_byte() != b',' {
                return Err("element followed by something else than a comma");
            }
            self.pos += 1;
        }
    }

    fn parse_elem(&mut self) -> Result<(), &'static str> {
        let start = self.parse_port()?;
        if self.at_end() || self.next_byte() != b'-' {
            self.list.add_port(start);
            return Ok(());
        }
        self.pos += 1;
        let end = self.parse_port()?;
        if end < start {
            return Err("invalid range (end < start)");
        }
        self.list.add_range(start, end);
        Ok(())
    }

    fn parse_port(&mut self) -> Result<u16, &'static str> {
        if self.at_end() {
            return Err("empty port string");
        }
        let mut value: u32 = 0;
        let mut digits = 0;
        while !self.at_end() {
            let b = self.next_byte();
            if !b.is_ascii_digit() {
                break;
            }
            value = value.saturating_mul(10).saturating_add(u32::from(b - b'0'));
            digits += 1;
            self.pos += 1;
        }
        if digits == 0 {
            return Err("empty port string");
        }
        if value == 0 || value > u32::from(u16::MAX) {
            return Err("invalid port value");
        }
        Ok(value as u16)
    }

    fn at_end(&self) -> bool {
        self.pos == self.bytes.len()
    }

    fn next_byte(&self) -> u8 {
        self.bytes[self.pos]
    }
}

impl PortList {
    /// Parses a specification like `"5000-5010,6000,6100-6105"`.
    ///
    /// A malformed specification (syntax error, port outside 1..=65535,
    /// range end before start) yields an empty list, i.e. "no ports
    /// available"; the decision whether that is fatal is the caller's.
    pub fn from_spec(spec: &str) -> PortList {
        match SpecParser::new(spec).parse() {
            Ok(list) => list,
            Err(reason) => {
                crate::launcher::launcher_event(
                    "ports",
                    format!("outcome=malformed_spec spec={spec:?} reason={reason}"),
                );
                PortList::default()
            }
        }
    }

    pub fn add_port(&mut self, port: u16) {
        self.add_range(port, port);
    }

    pub fn add_range(&mut self, start: u16, end: u16) {
        self.ranges.push(PortRange { start, end });
    }

    pub fn has_more(&self) -> bool {
        !self.ranges.is_empty()
    }

    /// Pops the lowest remaining port of the first range.
    ///
    /// Calling this on an empty list is a programming error.
    pub fn get_next(&mut self) -> u16 {
        let first = self
            .ranges
            .first_mut()
            .expect("get_next called on an exhausted port list");
        let next = first.start;
        if first.start == first.end {
            self.ranges.remove(0);
        } else {
            first.start += 1;
        }
        next
    }

    pub fn contains(&self, port: u16) -> bool {
        self.ranges
            .iter()
            .any(|r| port >= r.start && port <= r.end)
    }

    pub fn count(&self) -> usize {
        self.ranges
            .iter()
            .map(|r| usize::from(r.end - r.start) + 1)
            .sum()
    }
}

impl std::fmt::Display for PortList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, r) in self.ranges.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            if r.start == r.end {
                write!(f, "{}", r.start)?;
            } else {
                write!(f, "{}-{}", r.start, r.end)?;
            }
        }
        Ok(())
    }
}

/// Allocation policy: try to bind each candidate in turn and hand back the
/// first port that succeeds. Returns `None` once the list is exhausted.
pub fn find_first_free_port(range: &mut PortList) -> Option<u16> {
    bind_first_free(range).map(|(listener, port)| {
        drop(listener);
        port
    })
}

/// Like [`find_first_free_port`] but keeps the bound listener, for callers
/// that hand the socket over instead of letting the application re-bind it.
pub fn bind_first_free(range: &mut PortList) -> Option<(TcpListener, u16)> {
    while range.has_more() {
        let port = range.get_next();
        if let Ok(listener) = TcpListener::bind(("0.0.0.0", port)) {
            return Some((listener, port));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(mut list: PortList) -> Vec<u16> {
        let mut out = vec![];
        while list.has_more() {
            out.push(list.get_next());
        }
        out
    }

    #[test]
    fn parses_single_port() {
        let list = PortList::from_spec("5000");
        assert_eq!(list.count(), 1);
        assert!(list.contains(5000));
        assert_eq!(drain(list), vec![5000]);
    }

    #[test]
    fn enumerates_in_spec_order() {
        let list = PortList::from_spec("5000-5002,6000,6100-6101");
        assert_eq!(list.count(), 6);
        assert_eq!(drain(list), vec![5000, 5001, 5002, 6000, 6100, 6101]);
    }

    #[test]
    fn later_range_may_precede_earlier_one() {
        // Ranges are never reordered, even if a later one holds lower ports.
        let list = PortList::from_spec("6000,5000-5001");
        assert_eq!(drain(list), vec![6000, 5000, 5001]);
    }

    #[test]
    fn malformed_specs_yield_empty_list() {
        for spec in ["5-3", "abc", "70000", ",5000", "5000-", "5000,", "0",
                     "5000 - 5001", " 5000", "1-2-3", "99999999999999"] {
            let list = PortList::from_spec(spec);
            assert!(!list.has_more(), "spec {spec:?} should parse to empty");
        }
    }

    #[test]
    fn empty_spec_is_valid_and_empty() {
        assert!(!PortList::from_spec("").has_more());
    }

    #[test]
    fn to_string_round_trips_contents() {
        let spec = "5000-5010,6000,6100-6105";
        let list = PortList::from_spec(spec);
        let rendered = list.to_string();
        let reparsed = PortList::from_spec(&rendered);
        assert_eq!(drain(list), drain(reparsed));
    }

    #[test]
    fn adjacent_ranges_are_not_merged() {
        let list = PortList::from_spec("5000-5001,5002");
        assert_eq!(list.to_string(), "5000-5001,5002");
    }

    #[test]
    fn contains_and_count() {
        let list = PortList::from_spec("10-12,20");
        assert_eq!(list.count(), 4);
        assert!(list.contains(11));
        assert!(!list.contains(13));
        assert!(list.contains(20));
    }

    #[test]
    fn bounds_are_inclusive() {
        let list = PortList::from_spec("1,65535");
        assert_eq!(drain(list), vec![1, 65535]);
    }

    #[test]
    fn allocation_skips_a_bound_port() {
        // Hold one OS-assigned port, free another, then ask the allocator
        // to pick between them: it must skip the held one.
        let held = TcpListener::bind(("0.0.0.0", 0)).unwrap();
        let held_port = held.local_addr().unwrap().port();
        let free_port = {
            let l = TcpListener::bind(("0.0.0.0", 0)).unwrap();
            l.local_addr().unwrap().port()
        };
        let mut range = PortList::from_spec(&format!("{held_port},{free_port}"));
        assert_eq!(find_first_free_port(&mut range), Some(free_port));
    }

    #[test]
    fn allocation_fails_when_exhausted() {
        let held = TcpListener::bind(("0.0.0.0", 0)).unwrap();
        let held_port = held.local_addr().unwrap().port();
        let mut range = PortList::from_spec(&format!("{held_port}"));
        assert_eq!(find_first_free_port(&mut range), None);
        assert!(!range.has_more());
    }
}
