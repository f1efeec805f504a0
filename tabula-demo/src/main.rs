//! Tabula demo: two clients editing one table, headless.
//!
//! Alice creates the table and Bob joins. Alice bulk-inserts random rows,
//! Bob selects a cell and votes, Alice sees Bob's selection, Bob leaves and
//! Alice's roster and highlights follow, then Alice undoes her insert.
//!
//! Run with `RUST_LOG=debug` for per-step detail. `TABULA_ROWS` sets the
//! number of inserted rows (default 1000).

use log::{error, info};
use rand::Rng;

use tabula_collab::{
    BroadcastGroup, ChangeBridge, CollabError, Selection, Session, SessionConfig, UserInfo,
    ViewChange,
};
use tabula_core::{CellId, DateTime, Hint, Table};

const DEFAULT_ROWS: usize = 1000;

fn row_count_from_env() -> usize {
    match std::env::var("TABULA_ROWS") {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            log::warn!("Ignoring invalid TABULA_ROWS={raw:?}");
            DEFAULT_ROWS
        }),
        Err(_) => DEFAULT_ROWS,
    }
}

fn settle(sessions: &mut [&mut Session]) -> Result<(), CollabError> {
    for _ in 0..3 {
        for session in sessions.iter_mut() {
            session.sync()?;
        }
    }
    Ok(())
}

fn run() -> Result<(), CollabError> {
    let rows = row_count_from_env();
    let group = BroadcastGroup::new(4096);

    let mut alice = Session::create(
        &group,
        UserInfo::new("alice", "Alice"),
        Table::with_default_schema(0),
        SessionConfig::default(),
    )?;
    let mut bob = Session::join(&group, UserInfo::new("bob", "Bob"), SessionConfig::default())?;
    settle(&mut [&mut alice, &mut bob])?;
    info!(
        "Bob joined: {} columns, synced = {}",
        bob.table().column_count(),
        bob.is_synced()
    );

    let bridge = ChangeBridge::new();
    bridge.watch_table(alice.table());
    bridge.watch_selection(alice.selection());
    bridge.watch_users(alice.users());
    let _log_changes = bridge.subscribe(|change| match change {
        ViewChange::Table(change) => log::debug!(
            "Alice's view: table changed ({} rows touched, structure: {})",
            change.rows.len(),
            change.row_structure
        ),
        ViewChange::Selection(event) => {
            log::debug!("Alice's view: selection {:?} from {}", event.origin, event.session)
        }
        ViewChange::Users => log::debug!("Alice's view: roster changed"),
    });

    // Alice fills the table in one commit.
    let columns = alice.table().column_ids().to_vec();
    let (text, number, done, date) = (columns[0], columns[1], columns[2], columns[3]);
    let mut rng = rand::rng();
    let detached = (0..rows)
        .map(|i| {
            let mut row = alice.table().create_detached_row();
            row.set_value(text, format!("Task {i}"))
                .set_value(number, rng.random_range(0..1000) as f64)
                .set_value(done, rng.random_bool(0.3));
            row
        })
        .collect();
    alice.table_mut().append_rows(detached)?;
    settle(&mut [&mut alice, &mut bob])?;
    info!(
        "Alice inserted {} rows; Bob sees {}",
        alice.table().row_count(),
        bob.table().row_count()
    );

    // Bob works on the first row.
    let vote = bob
        .table()
        .columns()
        .find(|column| column.hint() == Some(Hint::Vote))
        .map(|column| column.id());
    if let Some(first) = bob.table().row_ids().first().copied() {
        bob.selection()
            .select(Selection::cell(CellId::new(first, text)))?;
        let mut row = bob.table_mut().row_mut(first)?;
        if let Some(vote) = vote {
            row.toggle_vote(vote, "bob")?;
        }
        if !row.set_date(date, DateTime::now().millis() as f64)? {
            log::warn!("Rejected date for row {first}");
        }
    }
    settle(&mut [&mut alice, &mut bob])?;

    for (selection, sessions) in alice.selection().get_remote_selected() {
        info!("Alice sees {:?} {} selected by {:?}", selection.kind, selection.id, sessions);
    }
    info!(
        "Connected users seen by Alice: {:?}",
        alice
            .users()
            .get_connected_users()
            .iter()
            .map(|user| user.info.name.as_str())
            .collect::<Vec<_>>()
    );

    // Bob leaves; his selection stops being highlighted.
    bob.disconnect()?;
    alice.sync()?;
    info!(
        "After Bob left: {} remote selections, disconnected users {:?}",
        alice.selection().get_remote_selected().len(),
        alice
            .users()
            .get_disconnected_users()
            .iter()
            .map(|user| user.info.name.as_str())
            .collect::<Vec<_>>()
    );

    // Only Alice's own commits are on her undo stack.
    while alice.undo()? {}
    alice.sync()?;
    info!(
        "Alice undid her insert: {} rows left, view dirty = {}, {} notifications",
        alice.table().row_count(),
        bridge.take_dirty(),
        bridge.forwarded()
    );
    Ok(())
}

fn main() {
    env_logger::init();
    info!("Tabula demo starting");
    if let Err(e) = run() {
        error!("Demo failed: {e}");
        std::process::exit(1);
    }
}
