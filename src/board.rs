//! Kanban ordering.
//!
//! Tasks of a project are split into buckets by status. Within a bucket the
//! `position` values are always exactly `0..n-1`. A move is planned here as a
//! list of range shifts plus the moved task's final slot; the task repository
//! applies the plan inside one transaction so the bucket never becomes
//! observable with a gap or a duplicate.

use serde::{Deserialize, Serialize};

use crate::models::TaskStatus;

/// Where a task sits on the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub status: TaskStatus,
    pub position: i64,
}

impl Slot {
    pub fn new(status: TaskStatus, position: i64) -> Self {
        Self { status, position }
    }
}

/// Add `delta` to every position in `from..=to` of the `status` bucket.
/// `to == None` means no upper bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionShift {
    pub status: TaskStatus,
    pub from: i64,
    pub to: Option<i64>,
    pub delta: i64,
}

impl PositionShift {
    pub fn covers(&self, slot: Slot) -> bool {
        slot.status == self.status
            && slot.position >= self.from
            && self.to.map_or(true, |to| slot.position <= to)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MovePlan {
    pub shifts: Vec<PositionShift>,
    /// Final slot of the moved task, after clamping.
    pub target: Slot,
}

impl MovePlan {
    pub fn is_noop(&self, current: Slot) -> bool {
        self.shifts.is_empty() && self.target == current
    }
}

/// Plan moving a task from `current` to `requested`.
///
/// `target_len` is the number of tasks presently in the requested bucket,
/// counting the moving task itself when it already lives there. The requested
/// position is clamped into the bucket: negative values land at the top,
/// values past the end append.
pub fn plan_move(current: Slot, requested: Slot, target_len: i64) -> MovePlan {
    let same_column = current.status == requested.status;
    let max_position = if same_column {
        (target_len - 1).max(0)
    } else {
        target_len.max(0)
    };
    let target = Slot::new(requested.status, requested.position.clamp(0, max_position));

    let mut shifts = Vec::with_capacity(2);
    if same_column {
        if target.position > current.position {
            shifts.push(PositionShift {
                status: current.status,
                from: current.position + 1,
                to: Some(target.position),
                delta: -1,
            });
        } else if target.position < current.position {
            shifts.push(PositionShift {
                status: current.status,
                from: target.position,
                to: Some(current.position - 1),
                delta: 1,
            });
        }
    } else {
        // Close the gap in the old column, then open a slot in the new one.
        shifts.push(PositionShift {
            status: current.status,
            from: current.position + 1,
            to: None,
            delta: -1,
        });
        shifts.push(PositionShift {
            status: target.status,
            from: target.position,
            to: None,
            delta: 1,
        });
    }

    MovePlan { shifts, target }
}
