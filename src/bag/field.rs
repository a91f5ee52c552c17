//! The field-kind → default-key-octets table used by `create_typed` when
//! the caller passes `key_octets = 0` (spec.md §4.3).

/// What a Bag's key represents, independent of its storage width.
///
/// Grounded on `skbag.h`'s `skBagFieldType_en` (spec.md §4.3's "Default
/// field type → length mapping" table is an abstract of that enum); only
/// the field *kinds* the table distinguishes are modeled, not every one of
/// the C enum's ~30 values, since the rest share a default width with one
/// of these.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FieldKind {
    /// Source, destination, or next-hop IPv4 address.
    Ipv4,
    /// Source, destination, or next-hop IPv6 address.
    Ipv6,
    /// Source or destination port.
    Port,
    /// IP protocol number.
    Protocol,
    /// SNMP input or output interface.
    Snmp,
    /// Sensor identifier.
    Sensor,
    /// Caller-defined field; the caller must supply `key_octets` explicitly.
    Custom,
}

impl FieldKind {
    /// The key width this field kind uses when the caller doesn't specify
    /// one, or `None` for `Custom`, which has no default.
    pub fn default_key_octets(self) -> Option<u8> {
        match self {
            FieldKind::Ipv4 => Some(4),
            FieldKind::Ipv6 => Some(16),
            FieldKind::Port => Some(2),
            FieldKind::Protocol => Some(1),
            FieldKind::Snmp => Some(4),
            FieldKind::Sensor => Some(2),
            FieldKind::Custom => None,
        }
    }

    /// The tag written to a file header's `Bag` entry.
    pub(crate) fn to_tag(self) -> u16 {
        match self {
            FieldKind::Ipv4 => 0,
            FieldKind::Ipv6 => 1,
            FieldKind::Port => 2,
            FieldKind::Protocol => 3,
            FieldKind::Snmp => 4,
            FieldKind::Sensor => 5,
            FieldKind::Custom => 255,
        }
    }

    pub(crate) fn from_tag(tag: u16) -> FieldKind {
        match tag {
            0 => FieldKind::Ipv4,
            1 => FieldKind::Ipv6,
            2 => FieldKind::Port,
            3 => FieldKind::Protocol,
            4 => FieldKind::Snmp,
            5 => FieldKind::Sensor,
            _ => FieldKind::Custom,
        }
    }
}

/// Which field of a [`crate::FlowRecord`] a Bag is keyed on, when built via
/// [`super::Bag::from_records`].
///
/// Grounded on `skbag.h`'s `SKBAG_FIELD_SIPv4`/`DIPv4`/`SPORT`/`DPORT`/
/// `PROTO` — the subset of `skBagFieldType_en` that names a record field
/// directly rather than a derived value like flow count.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RecordKeyField {
    SrcIp,
    DstIp,
    SrcPort,
    DstPort,
    Protocol,
}

impl RecordKeyField {
    pub(crate) fn field_kind(self) -> FieldKind {
        match self {
            RecordKeyField::SrcIp | RecordKeyField::DstIp => FieldKind::Ipv4,
            RecordKeyField::SrcPort | RecordKeyField::DstPort => FieldKind::Port,
            RecordKeyField::Protocol => FieldKind::Protocol,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_has_no_default() {
        assert_eq!(FieldKind::Custom.default_key_octets(), None);
    }

    #[test]
    fn ipv6_defaults_to_sixteen_octets() {
        assert_eq!(FieldKind::Ipv6.default_key_octets(), Some(16));
    }
}
