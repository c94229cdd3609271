//! Trigger firing.
//!
//! `fire_triggers` resolves the creation-ordered trigger list for a table /
//! timing / event and executes each action with the OLD/NEW row context
//! installed on the database handle. `RAISE(ABORT, msg)` aborts the current
//! DML row with a trigger-abort error; `RAISE(IGNORE)` surfaces the internal
//! ignore marker, which the DML loop turns into "skip this row". A depth
//! gate keeps trigger-body DML from re-firing triggers.

use crate::db::database::Database;
use crate::db::schema::{RaiseKind, TriggerAction, TriggerDef, TriggerEvent, TriggerTiming};
use crate::error::{DBError, TriggerError};
use crate::exec::eval::TriggerRowCtx;
use micadb_types::Row;

#[tracing::instrument(skip_all, fields(table = table))]
pub(crate) fn fire_triggers(
    db: &mut Database,
    table: &str,
    timing: TriggerTiming,
    event: TriggerEvent,
    old: Option<&Row>,
    new: Option<&Row>,
) -> Result<(), DBError> {
    if db.trigger_depth > 0 {
        return Ok(());
    }
    let triggers: Vec<TriggerDef> = db
        .catalog()
        .triggers()
        .iter()
        .filter(|t| t.timing == timing && t.event == event && t.table.eq_ignore_ascii_case(table))
        .cloned()
        .collect();
    if triggers.is_empty() {
        return Ok(());
    }

    let columns = db
        .catalog()
        .require_table(table)?
        .columns
        .iter()
        .map(|c| c.name.clone())
        .collect();
    let saved_ctx = db.trigger_ctx.replace(TriggerRowCtx {
        columns,
        old: old.cloned(),
        new: new.cloned(),
    });
    db.trigger_depth += 1;

    let result = run_actions(db, &triggers);

    db.trigger_depth -= 1;
    db.trigger_ctx = saved_ctx;
    result
}

fn run_actions(db: &mut Database, triggers: &[TriggerDef]) -> Result<(), DBError> {
    for trigger in triggers {
        log::trace!("firing trigger {}", trigger.name);
        for action in &trigger.actions {
            match action {
                TriggerAction::Raise(RaiseKind::Abort, message) => {
                    return Err(TriggerError::Abort(message.clone().unwrap_or_default()).into());
                }
                TriggerAction::Raise(RaiseKind::Ignore, _) => {
                    return Err(TriggerError::Ignore.into());
                }
                TriggerAction::Statement(stmt) => {
                    crate::sql::execute::dispatch_statement(db, stmt)?;
                }
            }
        }
    }
    Ok(())
}
