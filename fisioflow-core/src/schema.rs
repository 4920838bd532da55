//! Relational schema for the voucher engine.
//!
//! Money columns are decimal TEXT, instants fixed-width RFC 3339 TEXT (see
//! `fisioflow_store::codec`). Ledger amounts are positive for every kind
//! except `REVERSAL`, which carries the negated amount of the entry it
//! reverses plus that entry's kind in `reversed_kind`.

/// Migration component name in `schema_migrations`.
pub const COMPONENT: &str = "voucher_core";

/// Ordered, append-only migration scripts.
pub const MIGRATIONS: &[&str] = &[
    // v1: entities
    "
    CREATE TABLE partners (
        id                  TEXT PRIMARY KEY,
        name                TEXT NOT NULL,
        status              TEXT NOT NULL,
        platform_pct        TEXT NOT NULL,
        gateway_pct         TEXT NOT NULL,
        tax_pct             TEXT NOT NULL,
        partner_pct         TEXT NOT NULL,
        minimum_withdrawal  TEXT,
        total_revenue       TEXT NOT NULL,
        total_commission    TEXT NOT NULL,
        pending_balance     TEXT NOT NULL,
        available_balance   TEXT NOT NULL,
        total_withdrawn     TEXT NOT NULL,
        total_sessions      INTEGER NOT NULL DEFAULT 0,
        completed_sessions  INTEGER NOT NULL DEFAULT 0,
        cancelled_sessions  INTEGER NOT NULL DEFAULT 0,
        no_show_sessions    INTEGER NOT NULL DEFAULT 0,
        last_withdrawal_at  TEXT,
        created_at          TEXT NOT NULL,
        updated_at          TEXT NOT NULL
    );

    CREATE TABLE patients (
        id          TEXT PRIMARY KEY,
        name        TEXT NOT NULL,
        created_at  TEXT NOT NULL
    );

    CREATE TABLE vouchers (
        id               TEXT PRIMARY KEY,
        code             TEXT NOT NULL,
        partner_id       TEXT NOT NULL REFERENCES partners(id),
        patient_id       TEXT NOT NULL REFERENCES patients(id),
        voucher_type     TEXT NOT NULL,
        status           TEXT NOT NULL,
        price            TEXT NOT NULL,
        discount         TEXT NOT NULL,
        final_price      TEXT NOT NULL,
        unit_price       TEXT,
        sessions_total   INTEGER NOT NULL CHECK (sessions_total >= 1),
        sessions_used    INTEGER NOT NULL DEFAULT 0
                         CHECK (sessions_used >= 0 AND sessions_used <= sessions_total),
        valid_from       TEXT NOT NULL,
        valid_until      TEXT NOT NULL CHECK (valid_until > valid_from),
        payment_status   TEXT NOT NULL,
        payment_id       TEXT,
        payment_method   TEXT,
        payment_failure  TEXT,
        paid_at          TEXT,
        first_used_at    TEXT,
        last_used_at     TEXT,
        cancelled_at     TEXT,
        refunded_at      TEXT,
        created_at       TEXT NOT NULL,
        updated_at       TEXT NOT NULL
    );
    CREATE UNIQUE INDEX idx_vouchers_code ON vouchers(code);
    CREATE INDEX idx_vouchers_partner ON vouchers(partner_id);
    CREATE INDEX idx_vouchers_expiry ON vouchers(status, valid_until);

    CREATE TABLE sessions (
        id                 TEXT PRIMARY KEY,
        voucher_id         TEXT REFERENCES vouchers(id),
        partner_id         TEXT NOT NULL REFERENCES partners(id),
        patient_id         TEXT NOT NULL REFERENCES patients(id),
        scheduled_at       TEXT NOT NULL,
        status             TEXT NOT NULL,
        price              TEXT NOT NULL,
        notes              TEXT,
        platform_pct       TEXT,
        gateway_pct        TEXT,
        tax_pct            TEXT,
        partner_pct        TEXT,
        platform_fee       TEXT,
        gateway_fee        TEXT,
        tax_fee            TEXT,
        partner_net        TEXT,
        payment_processed  INTEGER NOT NULL DEFAULT 0,
        completed_at       TEXT,
        cancelled_at       TEXT,
        cancel_reason      TEXT,
        matured_at         TEXT,
        reversed_at        TEXT,
        created_at         TEXT NOT NULL,
        updated_at         TEXT NOT NULL
    );
    CREATE INDEX idx_sessions_voucher ON sessions(voucher_id);
    CREATE INDEX idx_sessions_pending ON sessions(partner_id, status, matured_at);

    CREATE TABLE withdrawals (
        id              TEXT PRIMARY KEY,
        partner_id      TEXT NOT NULL REFERENCES partners(id),
        amount          TEXT NOT NULL,
        fee             TEXT NOT NULL,
        net_amount      TEXT NOT NULL,
        status          TEXT NOT NULL,
        destination     TEXT NOT NULL,
        external_ref    TEXT,
        transaction_id  TEXT,
        reserved        INTEGER NOT NULL DEFAULT 0,
        failure_reason  TEXT,
        cancel_reason   TEXT,
        requested_at    TEXT NOT NULL,
        processing_at   TEXT,
        completed_at    TEXT,
        failed_at       TEXT,
        cancelled_at    TEXT,
        updated_at      TEXT NOT NULL
    );
    CREATE UNIQUE INDEX idx_withdrawals_external_ref
        ON withdrawals(external_ref) WHERE external_ref IS NOT NULL;
    CREATE INDEX idx_withdrawals_partner ON withdrawals(partner_id, status);
    ",
    // v2: ledger
    "
    CREATE TABLE ledger_entries (
        id             INTEGER PRIMARY KEY AUTOINCREMENT,
        partner_id     TEXT NOT NULL REFERENCES partners(id),
        session_id     TEXT REFERENCES sessions(id),
        withdrawal_id  TEXT REFERENCES withdrawals(id),
        kind           TEXT NOT NULL,
        amount         TEXT NOT NULL,
        reversal_of    INTEGER REFERENCES ledger_entries(id),
        reversed_kind  TEXT,
        created_at     TEXT NOT NULL
    );
    CREATE INDEX idx_ledger_partner_time ON ledger_entries(partner_id, created_at);
    CREATE INDEX idx_ledger_session ON ledger_entries(session_id);
    CREATE UNIQUE INDEX idx_ledger_single_reversal
        ON ledger_entries(reversal_of) WHERE reversal_of IS NOT NULL;

    CREATE TRIGGER ledger_no_update BEFORE UPDATE ON ledger_entries
    BEGIN
        SELECT RAISE(ABORT, 'ledger_entries is append-only');
    END;
    CREATE TRIGGER ledger_no_delete BEFORE DELETE ON ledger_entries
    BEGIN
        SELECT RAISE(ABORT, 'ledger_entries is append-only');
    END;
    ",
];
