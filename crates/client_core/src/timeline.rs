use chrono::{Local, NaiveDate, TimeZone};
use shared::domain::UserId;

use crate::message::MessageRecord;

#[derive(Debug, Clone, PartialEq)]
pub enum TimelineItem {
    DaySeparator(NaiveDate),
    Message(MessageRecord),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Sending,
    Delivered,
    Read,
}

/// Whether `records[index]` opens a new calendar day in the local time zone.
pub fn day_boundary(records: &[MessageRecord], index: usize) -> bool {
    day_boundary_in(records, index, &Local)
}

pub fn day_boundary_in<Tz: TimeZone>(records: &[MessageRecord], index: usize, tz: &Tz) -> bool {
    let Some(current) = records.get(index) else {
        return false;
    };
    let Some(previous) = index.checked_sub(1).and_then(|prev| records.get(prev)) else {
        return true;
    };

    calendar_day(current, tz) != calendar_day(previous, tz)
}

pub fn build_timeline<Tz: TimeZone>(records: &[MessageRecord], tz: &Tz) -> Vec<TimelineItem> {
    let mut items = Vec::with_capacity(records.len() + 1);
    for (index, record) in records.iter().enumerate() {
        if day_boundary_in(records, index, tz) {
            items.push(TimelineItem::DaySeparator(calendar_day(record, tz)));
        }
        items.push(TimelineItem::Message(record.clone()));
    }
    items
}

/// Status badge for `records[index]`. Pending records show as sending; read
/// state is only reported on the newest confirmed record of the local user.
pub fn delivery_status(
    records: &[MessageRecord],
    index: usize,
    local_user: &UserId,
) -> Option<DeliveryStatus> {
    let record = records.get(index)?;
    if &record.sender_id != local_user {
        return None;
    }
    if record.is_pending {
        return Some(DeliveryStatus::Sending);
    }

    let newest_confirmed = records
        .iter()
        .rposition(|candidate| &candidate.sender_id == local_user && !candidate.is_pending)?;
    if newest_confirmed != index {
        return None;
    }

    Some(if record.is_read {
        DeliveryStatus::Read
    } else {
        DeliveryStatus::Delivered
    })
}

fn calendar_day<Tz: TimeZone>(record: &MessageRecord, tz: &Tz) -> NaiveDate {
    record.created_at.with_timezone(tz).date_naive()
}
