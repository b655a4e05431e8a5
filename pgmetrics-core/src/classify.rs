//! SQLSTATE-based error taxonomy: deciding whether a failed statement
//! is worth retrying or should be treated as final.

use crate::db::DbError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Temporary,
    Permanent,
}

const UNIQUE_VIOLATION: &str = "23505";
const DEADLOCK_DETECTED: &str = "40P01";
const DUPLICATE_COLUMN: &str = "42701";
const DUPLICATE_TABLE: &str = "42P07";
const QUERY_CANCELLED: &str = "57014";
const DATABASE_DROPPED: &str = "57P04";
const TAG_TABLE_UNIQUE_INDEX: &str = "pg_type_typname_nsp_index";

/// Class 25: invalid transaction state.
fn is_class(sqlstate: &str, class: &str) -> bool {
    sqlstate.get(0..2) == Some(class)
}

pub fn classify(err: &dyn DbError) -> Severity {
    if err.is_driver_temporary() {
        return Severity::Temporary;
    }

    let Some(sqlstate) = err.sqlstate() else {
        return Severity::Permanent;
    };

    // query_cancelled and database_dropped are pulled out of class 57
    // ahead of the class check: the driver issues a cancel on a
    // type-conversion error it can never retry its way out of, and a
    // retry of the identical statement fails identically forever.
    if sqlstate == QUERY_CANCELLED || sqlstate == DATABASE_DROPPED {
        return Severity::Permanent;
    }

    if sqlstate == UNIQUE_VIOLATION {
        return if err.constraint_name() == Some(TAG_TABLE_UNIQUE_INDEX) {
            Severity::Temporary
        } else {
            Severity::Permanent
        };
    }

    if sqlstate == DEADLOCK_DETECTED || sqlstate == DUPLICATE_COLUMN || sqlstate == DUPLICATE_TABLE
    {
        return Severity::Temporary;
    }

    if is_class(sqlstate, "25") || is_class(sqlstate, "53") || is_class(sqlstate, "57") {
        return Severity::Temporary;
    }

    Severity::Permanent
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::mock::MockDbError;

    #[test]
    fn duplicate_table_is_temporary() {
        let err = MockDbError::new(DUPLICATE_TABLE, "duplicate_table");
        assert_eq!(classify(&err), Severity::Temporary);
    }

    #[test]
    fn duplicate_column_is_temporary() {
        let err = MockDbError::new(DUPLICATE_COLUMN, "duplicate_column");
        assert_eq!(classify(&err), Severity::Temporary);
    }

    #[test]
    fn deadlock_is_temporary() {
        let err = MockDbError::new(DEADLOCK_DETECTED, "deadlock_detected");
        assert_eq!(classify(&err), Severity::Temporary);
    }

    #[test]
    fn class_53_insufficient_resources_is_temporary() {
        let err = MockDbError::new("53300", "too_many_connections");
        assert_eq!(classify(&err), Severity::Temporary);
    }

    #[test]
    fn class_57_is_temporary_except_the_two_named_exceptions() {
        let err = MockDbError::new("57P01", "admin_shutdown");
        assert_eq!(classify(&err), Severity::Temporary);

        let cancelled = MockDbError::new(QUERY_CANCELLED, "query_cancelled");
        assert_eq!(classify(&cancelled), Severity::Permanent);

        let dropped = MockDbError::new(DATABASE_DROPPED, "database_dropped");
        assert_eq!(classify(&dropped), Severity::Permanent);
    }

    #[test]
    fn unique_violation_is_temporary_only_on_the_tag_table_index() {
        let on_tag_index =
            MockDbError::new(UNIQUE_VIOLATION, "dup").with_constraint(TAG_TABLE_UNIQUE_INDEX);
        assert_eq!(classify(&on_tag_index), Severity::Temporary);

        let elsewhere = MockDbError::new(UNIQUE_VIOLATION, "dup").with_constraint("some_other_key");
        assert_eq!(classify(&elsewhere), Severity::Permanent);
    }

    #[test]
    fn unknown_sqlstate_is_permanent() {
        let err = MockDbError::new("42601", "syntax_error");
        assert_eq!(classify(&err), Severity::Permanent);
    }

    #[test]
    fn driver_flagged_temporary_overrides_sqlstate() {
        let mut err = MockDbError::new("42601", "syntax_error");
        err.driver_temporary = true;
        assert_eq!(classify(&err), Severity::Temporary);
    }
}
