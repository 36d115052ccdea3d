use time::{format_description::well_known::Rfc3339, OffsetDateTime};

pub(crate) fn format_offset(value: OffsetDateTime) -> String {
    value.format(&Rfc3339).unwrap_or_else(|_| value.to_string())
}

pub(crate) fn now_rfc3339() -> String {
    format_offset(OffsetDateTime::now_utc())
}
