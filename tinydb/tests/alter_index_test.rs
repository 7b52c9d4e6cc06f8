//! DDL scenarios: ALTER TABLE variants, secondary indexes, foreign keys.

use tempfile::tempdir;
use tinydb::{
    AlterTableOp, ColumnDesc, ColumnType, Database, Error, IndexDesc, TableDesc, Value,
};

fn users_table() -> TableDesc {
    TableDesc::new(
        "users",
        vec![
            ColumnDesc::new("id", ColumnType::Integer).primary_key(),
            ColumnDesc::new("name", ColumnType::Text).not_null(),
        ],
    )
}

#[test]
fn add_column_backfills_null_and_remove_restores_projection() {
    let dir = tempdir().unwrap();
    let mut db = Database::open(dir.path().join("alter.db")).unwrap();
    db.create_table(users_table()).unwrap();
    db.insert("users", vec![Value::Integer(1), Value::Text("Alice".into())])
        .unwrap();
    db.insert("users", vec![Value::Integer(2), Value::Text("Bob".into())])
        .unwrap();

    db.alter_table(AlterTableOp::AddColumn {
        table: "users".into(),
        column: ColumnDesc::new("score", ColumnType::Real),
    })
    .unwrap();

    // Existing rows read the new column as NULL.
    assert_eq!(
        db.get("users", &[Value::Integer(1)]).unwrap(),
        Some(vec![
            Value::Integer(1),
            Value::Text("Alice".into()),
            Value::Null
        ])
    );
    // New inserts accept values for it.
    db.insert(
        "users",
        vec![Value::Integer(3), Value::Text("Cleo".into()), Value::Real(9.5)],
    )
    .unwrap();

    db.alter_table(AlterTableOp::RemoveColumn {
        table: "users".into(),
        column: "score".into(),
    })
    .unwrap();
    assert_eq!(
        db.get("users", &[Value::Integer(3)]).unwrap(),
        Some(vec![Value::Integer(3), Value::Text("Cleo".into())])
    );
    assert_eq!(
        db.get("users", &[Value::Integer(1)]).unwrap(),
        Some(vec![Value::Integer(1), Value::Text("Alice".into())])
    );
}

#[test]
fn add_column_restrictions() {
    let dir = tempdir().unwrap();
    let mut db = Database::open(dir.path().join("addcol.db")).unwrap();
    db.create_table(users_table()).unwrap();

    assert!(matches!(
        db.alter_table(AlterTableOp::AddColumn {
            table: "users".into(),
            column: ColumnDesc::new("age", ColumnType::Integer).not_null(),
        }),
        Err(Error::Schema(_))
    ));
    assert!(matches!(
        db.alter_table(AlterTableOp::AddColumn {
            table: "users".into(),
            column: ColumnDesc::new("id2", ColumnType::Integer).primary_key(),
        }),
        Err(Error::Schema(_))
    ));
    assert!(matches!(
        db.alter_table(AlterTableOp::AddColumn {
            table: "users".into(),
            column: ColumnDesc::new("name", ColumnType::Text),
        }),
        Err(Error::Schema(_))
    ));
}

#[test]
fn remove_column_restrictions() {
    let dir = tempdir().unwrap();
    let mut db = Database::open(dir.path().join("rmcol.db")).unwrap();
    db.create_table(TableDesc::new(
        "t",
        vec![
            ColumnDesc::new("id", ColumnType::Integer).primary_key(),
            ColumnDesc::new("a", ColumnType::Text),
            ColumnDesc::new("b", ColumnType::Text),
        ],
    ))
    .unwrap();

    // Only the last column may go.
    assert!(matches!(
        db.alter_table(AlterTableOp::RemoveColumn {
            table: "t".into(),
            column: "a".into(),
        }),
        Err(Error::Schema(_))
    ));
    assert!(matches!(
        db.alter_table(AlterTableOp::RemoveColumn {
            table: "t".into(),
            column: "id".into(),
        }),
        Err(Error::Schema(_))
    ));
    db.alter_table(AlterTableOp::RemoveColumn {
        table: "t".into(),
        column: "b".into(),
    })
    .unwrap();

    // A column covered by an index is pinned.
    db.alter_table(AlterTableOp::AddColumn {
        table: "t".into(),
        column: ColumnDesc::new("c", ColumnType::Text),
    })
    .unwrap();
    db.create_index(IndexDesc::new("t_c_ix", "t", &["c"])).unwrap();
    assert!(matches!(
        db.alter_table(AlterTableOp::RemoveColumn {
            table: "t".into(),
            column: "c".into(),
        }),
        Err(Error::Schema(_))
    ));
    db.drop_index("t_c_ix").unwrap();
    db.alter_table(AlterTableOp::RemoveColumn {
        table: "t".into(),
        column: "c".into(),
    })
    .unwrap();
}

#[test]
fn rename_table_and_column_follow_through() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("rename.db");
    let mut db = Database::open(&path).unwrap();
    db.create_table(users_table()).unwrap();
    db.insert("users", vec![Value::Integer(1), Value::Text("Ann".into())])
        .unwrap();

    db.alter_table(AlterTableOp::RenameTable {
        table: "users".into(),
        new_name: "people".into(),
    })
    .unwrap();
    assert!(matches!(
        db.get("users", &[Value::Integer(1)]),
        Err(Error::NotFound(_))
    ));
    assert!(db.get("people", &[Value::Integer(1)]).unwrap().is_some());

    db.alter_table(AlterTableOp::RenameColumn {
        table: "people".into(),
        column: "name".into(),
        new_name: "full_name".into(),
    })
    .unwrap();

    // The rename survives reopen, and the renamed PK column still works.
    db.close().unwrap();
    let mut db = Database::open(&path).unwrap();
    assert!(db.get("people", &[Value::Integer(1)]).unwrap().is_some());
    db.insert("people", vec![Value::Integer(2), Value::Text("Bea".into())])
        .unwrap();

    // Collisions are refused.
    db.create_table(users_table()).unwrap();
    assert!(matches!(
        db.alter_table(AlterTableOp::RenameTable {
            table: "people".into(),
            new_name: "USERS".into(),
        }),
        Err(Error::DuplicateName(_))
    ));
}

#[test]
fn secondary_indexes_backfill_and_stay_in_sync() {
    let dir = tempdir().unwrap();
    let mut db = Database::open(dir.path().join("index.db")).unwrap();
    db.create_table(TableDesc::new(
        "books",
        vec![
            ColumnDesc::new("id", ColumnType::Integer).primary_key(),
            ColumnDesc::new("author", ColumnType::Text),
            ColumnDesc::new("isbn", ColumnType::Text),
        ],
    ))
    .unwrap();
    for (id, author, isbn) in [
        (1, "borges", "111"),
        (2, "calvino", "222"),
        (3, "borges", "333"),
    ] {
        db.insert(
            "books",
            vec![
                Value::Integer(id),
                Value::Text(author.into()),
                Value::Text(isbn.into()),
            ],
        )
        .unwrap();
    }

    // Non-unique index tolerates duplicate authors on backfill.
    db.create_index(IndexDesc::new("books_author_ix", "books", &["author"]))
        .unwrap();
    // Unique index over unique data is fine.
    db.create_index(IndexDesc::new("books_isbn_ix", "books", &["isbn"]).unique())
        .unwrap();
    db.verify_integrity().unwrap();

    // The unique index now guards inserts and updates.
    assert!(matches!(
        db.insert(
            "books",
            vec![
                Value::Integer(4),
                Value::Text("eco".into()),
                Value::Text("111".into()),
            ],
        ),
        Err(Error::DuplicateKey(_))
    ));
    db.insert(
        "books",
        vec![
            Value::Integer(4),
            Value::Text("eco".into()),
            Value::Text("444".into()),
        ],
    )
    .unwrap();
    assert!(matches!(
        db.update(
            "books",
            &[Value::Integer(4)],
            vec![
                Value::Integer(4),
                Value::Text("eco".into()),
                Value::Text("222".into()),
            ],
        ),
        Err(Error::DuplicateKey(_))
    ));

    // Deletes unhook index entries; churn keeps both trees coherent.
    db.delete("books", &[Value::Integer(1)]).unwrap();
    db.insert(
        "books",
        vec![
            Value::Integer(5),
            Value::Text("borges".into()),
            Value::Text("111".into()),
        ],
    )
    .unwrap();
    db.verify_integrity().unwrap();

    // Duplicate index name, then teardown.
    assert!(matches!(
        db.create_index(IndexDesc::new("books_isbn_ix", "books", &["author"])),
        Err(Error::DuplicateName(_))
    ));
    db.drop_index("books_author_ix").unwrap();
    assert!(matches!(
        db.drop_index("books_author_ix"),
        Err(Error::NotFound(_))
    ));
}

#[test]
fn unique_index_backfill_fails_over_duplicate_data() {
    let dir = tempdir().unwrap();
    let mut db = Database::open(dir.path().join("dupix.db")).unwrap();
    db.create_table(TableDesc::new(
        "t",
        vec![
            ColumnDesc::new("id", ColumnType::Integer).primary_key(),
            ColumnDesc::new("v", ColumnType::Integer),
        ],
    ))
    .unwrap();
    db.insert("t", vec![Value::Integer(1), Value::Integer(7)]).unwrap();
    db.insert("t", vec![Value::Integer(2), Value::Integer(7)]).unwrap();

    assert!(matches!(
        db.create_index(IndexDesc::new("t_v_ix", "t", &["v"]).unique()),
        Err(Error::DuplicateKey(_))
    ));
    // The failed DDL rolled back entirely.
    db.create_index(IndexDesc::new("t_v_ix", "t", &["v"])).unwrap();
    db.verify_integrity().unwrap();
}

#[test]
fn foreign_keys_enforce_at_commit() {
    let dir = tempdir().unwrap();
    let mut db = Database::open(dir.path().join("fk.db")).unwrap();
    db.create_table(users_table()).unwrap();
    db.create_table(TableDesc::new(
        "posts",
        vec![
            ColumnDesc::new("id", ColumnType::Integer).primary_key(),
            ColumnDesc::new("author_id", ColumnType::Integer).references("users", "id"),
            ColumnDesc::new("title", ColumnType::Text),
        ],
    ))
    .unwrap();

    // Implicit mode: the statement's own commit runs the check.
    assert!(matches!(
        db.insert(
            "posts",
            vec![
                Value::Integer(1),
                Value::Integer(99),
                Value::Text("orphan".into()),
            ],
        ),
        Err(Error::Constraint(_))
    ));

    db.insert("users", vec![Value::Integer(1), Value::Text("Ann".into())])
        .unwrap();
    db.insert(
        "posts",
        vec![Value::Integer(1), Value::Integer(1), Value::Text("ok".into())],
    )
    .unwrap();
    // A nullable FK accepts NULL.
    db.insert(
        "posts",
        vec![Value::Integer(2), Value::Null, Value::Text("draft".into())],
    )
    .unwrap();

    // Deleting a referenced row fails; deleting the referent first works.
    assert!(matches!(
        db.delete("users", &[Value::Integer(1)]),
        Err(Error::Constraint(_))
    ));
    db.delete("posts", &[Value::Integer(1)]).unwrap();
    db.delete("users", &[Value::Integer(1)]).unwrap();
}

#[test]
fn explicit_transactions_defer_fk_checks_to_commit() {
    let dir = tempdir().unwrap();
    let mut db = Database::open(dir.path().join("fkdefer.db")).unwrap();
    db.create_table(users_table()).unwrap();
    db.create_table(TableDesc::new(
        "posts",
        vec![
            ColumnDesc::new("id", ColumnType::Integer).primary_key(),
            ColumnDesc::new("author_id", ColumnType::Integer).references("users", "id"),
        ],
    ))
    .unwrap();

    // Child first, parent second, all in one transaction: fine at commit.
    db.begin().unwrap();
    db.insert("posts", vec![Value::Integer(1), Value::Integer(5)])
        .unwrap();
    db.insert("users", vec![Value::Integer(5), Value::Text("late".into())])
        .unwrap();
    db.commit().unwrap();
    assert!(db.get("posts", &[Value::Integer(1)]).unwrap().is_some());

    // A dangling reference is caught at commit and dooms the transaction.
    db.begin().unwrap();
    db.insert("posts", vec![Value::Integer(2), Value::Integer(77)])
        .unwrap();
    assert!(matches!(db.commit(), Err(Error::Constraint(_))));
    db.rollback().unwrap();
    assert!(db.get("posts", &[Value::Integer(2)]).unwrap().is_none());
}

#[test]
fn schema_rules_for_foreign_keys_and_drop_table() {
    let dir = tempdir().unwrap();
    let mut db = Database::open(dir.path().join("fkschema.db")).unwrap();
    db.create_table(users_table()).unwrap();

    // FK must hit an existing table's primary key, with a matching type.
    assert!(matches!(
        db.create_table(TableDesc::new(
            "a",
            vec![
                ColumnDesc::new("id", ColumnType::Integer).primary_key(),
                ColumnDesc::new("uid", ColumnType::Integer).references("ghost", "id"),
            ],
        )),
        Err(Error::Schema(_))
    ));
    assert!(matches!(
        db.create_table(TableDesc::new(
            "b",
            vec![
                ColumnDesc::new("id", ColumnType::Integer).primary_key(),
                ColumnDesc::new("uname", ColumnType::Text).references("users", "name"),
            ],
        )),
        Err(Error::Schema(_))
    ));
    assert!(matches!(
        db.create_table(TableDesc::new(
            "c",
            vec![
                ColumnDesc::new("id", ColumnType::Integer).primary_key(),
                ColumnDesc::new("uid", ColumnType::Text).references("users", "id"),
            ],
        )),
        Err(Error::Schema(_))
    ));

    db.create_table(TableDesc::new(
        "posts",
        vec![
            ColumnDesc::new("id", ColumnType::Integer).primary_key(),
            ColumnDesc::new("author_id", ColumnType::Integer).references("users", "id"),
        ],
    ))
    .unwrap();

    // A referenced table cannot be dropped out from under its children.
    assert!(matches!(db.drop_table("users"), Err(Error::Schema(_))));
    db.drop_table("posts").unwrap();
    db.drop_table("users").unwrap();
    assert!(matches!(db.drop_table("users"), Err(Error::NotFound(_))));
}

#[test]
fn schema_version_advances_on_every_ddl() {
    let dir = tempdir().unwrap();
    let mut db = Database::open(dir.path().join("version.db")).unwrap();
    let v0 = db.schema_version();
    db.create_table(users_table()).unwrap();
    let v1 = db.schema_version();
    assert!(v1 > v0);
    db.create_index(IndexDesc::new("users_name_ix", "users", &["name"]))
        .unwrap();
    let v2 = db.schema_version();
    assert!(v2 > v1);
    db.drop_index("users_name_ix").unwrap();
    assert!(db.schema_version() > v2);
}
