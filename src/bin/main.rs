// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use clap::Parser;
use csv::{ReaderBuilder, Trim, Writer};
use reading_ledger_rs::{
    AccountId, Actor, DisputeRuling, Engine, EntryKind, ExternalRef, ReadingEvent, ReadingId,
};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::PathBuf;
use std::process;

/// Reading Ledger - replay a marketplace event CSV
///
/// Reads booking/credit events from a CSV file, drives them through the
/// engine and outputs account snapshots to stdout.
#[derive(Parser, Debug)]
#[command(name = "reading-ledger-rs")]
#[command(about = "Replays marketplace credit and booking events from a CSV", long_about = None)]
struct Args {
    /// Path to CSV file with events
    ///
    /// Expected format: type,account,reader,reading,minutes,rate,amount,key,detail
    /// Example: cargo run -- events.csv > accounts.csv
    #[arg(value_name = "FILE")]
    input: PathBuf,
}

fn main() {
    let args = Args::parse();

    let file = match File::open(&args.input) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Error opening file '{}': {}", args.input.display(), e);
            process::exit(1);
        }
    };

    let engine = match process_events(BufReader::new(file)) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("Error processing events: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = write_accounts(&engine, std::io::stdout()) {
        eprintln!("Error writing output: {}", e);
        process::exit(1);
    }
}

/// Raw CSV record matching the input format.
///
/// Fields: `type, account, reader, reading, minutes, rate, amount, key, detail`
#[derive(Debug, Deserialize)]
struct CsvRecord {
    #[serde(rename = "type")]
    op: String,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    account: Option<u64>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    reader: Option<u64>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    reading: Option<u64>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    minutes: Option<u32>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    rate: Option<Decimal>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    amount: Option<i64>,
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    detail: Option<String>,
}

impl CsvRecord {
    /// Applies the record against the engine.
    ///
    /// Returns `None` for unknown operations or missing required fields,
    /// `Some(result)` otherwise.
    fn apply(self, engine: &Engine) -> Option<Result<(), reading_ledger_rs::EngineError>> {
        let result = match self.op.to_lowercase().as_str() {
            "open" => {
                let account = AccountId(self.account?);
                let rate = self.rate?;
                engine.ledger().open_account(account, rate);
                Ok(())
            }
            "purchase" => {
                let account = AccountId(self.account?);
                let amount = self.amount?;
                let key = self.key?;
                let payment = self.detail.unwrap_or_else(|| key.clone());
                engine
                    .ledger()
                    .credit(
                        account,
                        amount,
                        EntryKind::Purchase,
                        ExternalRef::Payment(payment),
                        key.as_str().into(),
                    )
                    .map(|_| ())
            }
            "request" => {
                let client = AccountId(self.account?);
                let reader = AccountId(self.reader?);
                let minutes = self.minutes?;
                let topic = self.detail.unwrap_or_default();
                engine
                    .request_reading(client, reader, topic, minutes)
                    .map(|_| ())
            }
            "checkout" => self.transition(engine, ReadingEvent::CheckoutStarted)?,
            "confirm" => {
                let payment_id = self.detail.clone()?;
                self.transition(engine, ReadingEvent::PaymentConfirmed { payment_id })?
            }
            "fail" => self.transition(engine, ReadingEvent::PaymentFailed)?,
            "start" => self.transition(engine, ReadingEvent::Start)?,
            "complete" => self.transition(engine, ReadingEvent::Complete)?,
            "cancel" => self.transition(engine, ReadingEvent::Cancel)?,
            "dispute" => {
                let reason = self.detail.clone().unwrap_or_default();
                self.transition(engine, ReadingEvent::FileDispute { reason })?
            }
            "resolve" => {
                let ruling = match self.detail.as_deref()? {
                    "refunded" => DisputeRuling::Refunded,
                    "denied" => DisputeRuling::Denied,
                    _ => return None,
                };
                self.transition(engine, ReadingEvent::ResolveDispute { ruling })?
            }
            _ => return None,
        };
        Some(result)
    }

    fn transition(
        &self,
        engine: &Engine,
        event: ReadingEvent,
    ) -> Option<Result<(), reading_ledger_rs::EngineError>> {
        let reading = ReadingId(self.reading?);
        let actor = match (&event, self.account) {
            (ReadingEvent::ResolveDispute { .. }, Some(account)) => {
                Actor::Moderator(AccountId(account))
            }
            (_, Some(account)) => Actor::Participant(AccountId(account)),
            (_, None) => Actor::System,
        };
        Some(engine.transition(reading, event, actor).map(|_| ()))
    }
}

/// Process events from a CSV reader.
///
/// Streaming, so arbitrarily large files work. Malformed rows and invalid
/// events are skipped; engine-level rejections (insufficient balance, illegal
/// transitions) are skipped too and logged in debug builds.
///
/// # CSV Format
///
/// Columns: `type, account, reader, reading, minutes, rate, amount, key, detail`
///
/// | type | uses |
/// |------|------|
/// | open | account, rate |
/// | purchase | account, amount, key, detail (payment id) |
/// | request | account (client), reader, minutes, detail (topic) |
/// | checkout / fail / start / complete / cancel | reading |
/// | confirm | reading, detail (payment id) |
/// | dispute | reading, account (raiser), detail (reason) |
/// | resolve | reading, account (moderator), detail (refunded/denied) |
///
/// Readings are numbered 1, 2, 3... in `request` row order.
///
/// # Errors
///
/// Returns a CSV error if the reader fails or the CSV structure is invalid.
pub fn process_events<R: Read>(reader: R) -> Result<Engine, csv::Error> {
    let engine = Engine::new();

    let mut rdr = ReaderBuilder::new()
        .trim(Trim::All)
        .flexible(true)
        .has_headers(true)
        .from_reader(reader);

    for result in rdr.deserialize::<CsvRecord>() {
        match result {
            Ok(record) => match record.apply(&engine) {
                None => {
                    #[cfg(debug_assertions)]
                    eprintln!("Skipping invalid event record");
                }
                Some(Err(_e)) => {
                    #[cfg(debug_assertions)]
                    eprintln!("Skipping rejected event: {}", _e);
                }
                Some(Ok(())) => {}
            },
            Err(_e) => {
                #[cfg(debug_assertions)]
                eprintln!("Skipping malformed row: {}", _e);
                continue;
            }
        }
    }

    Ok(engine)
}

/// Write account snapshots to a CSV writer.
///
/// Columns: `account, balance, rate_per_minute, entries, deactivated`
///
/// # Errors
///
/// Returns a CSV error if writing fails.
pub fn write_accounts<W: Write>(engine: &Engine, writer: W) -> Result<(), csv::Error> {
    let mut wtr = Writer::from_writer(writer);

    for account in engine.ledger().accounts() {
        wtr.serialize(&*account)?;
    }

    wtr.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn parse_purchase() {
        let csv = "type,account,reader,reading,minutes,rate,amount,key,detail\n\
                   purchase,1,,,,,100,evt_1,pay_1\n";
        let engine = process_events(Cursor::new(csv)).unwrap();
        assert_eq!(engine.ledger().balance(AccountId(1)).unwrap(), 100);
    }

    #[test]
    fn parse_full_booking_flow() {
        let csv = "type,account,reader,reading,minutes,rate,amount,key,detail\n\
                   open,1,,,,1.5,,,\n\
                   open,2,,,,1.5,,,\n\
                   purchase,1,,,,,100,evt_1,pay_1\n\
                   request,1,2,,30,,,,tarot\n\
                   confirm,,,1,,,,,pay_2\n\
                   start,,,1,,,,,\n\
                   complete,,,1,,,,,\n";
        let engine = process_events(Cursor::new(csv)).unwrap();

        // ceil(30 * 1.5) = 45 debited
        assert_eq!(engine.ledger().balance(AccountId(1)).unwrap(), 55);
        let reading = engine.reading(ReadingId(1)).unwrap();
        assert_eq!(reading.state(), reading_ledger_rs::ReadingState::Completed);
    }

    #[test]
    fn parse_cancel_refunds() {
        let csv = "type,account,reader,reading,minutes,rate,amount,key,detail\n\
                   open,1,,,,1,,,\n\
                   open,2,,,,1,,,\n\
                   purchase,1,,,,,50,evt_1,pay_1\n\
                   request,1,2,,30,,,,runes\n\
                   confirm,,,1,,,,,pay_2\n\
                   cancel,,,1,,,,,\n";
        let engine = process_events(Cursor::new(csv)).unwrap();
        assert_eq!(engine.ledger().balance(AccountId(1)).unwrap(), 50);
    }

    #[test]
    fn skip_malformed_and_unknown_rows() {
        let csv = "type,account,reader,reading,minutes,rate,amount,key,detail\n\
                   purchase,1,,,,,100,evt_1,pay_1\n\
                   frobnicate,what,,,,,,,\n\
                   purchase,2,,,,,50,evt_2,pay_2\n";
        let engine = process_events(Cursor::new(csv)).unwrap();
        assert_eq!(engine.ledger().balance(AccountId(1)).unwrap(), 100);
        assert_eq!(engine.ledger().balance(AccountId(2)).unwrap(), 50);
    }

    #[test]
    fn rejected_events_do_not_stop_processing() {
        // Second purchase replays the same key; confirm lacks balance.
        let csv = "type,account,reader,reading,minutes,rate,amount,key,detail\n\
                   open,1,,,,2,,,\n\
                   open,2,,,,2,,,\n\
                   purchase,1,,,,,10,evt_1,pay_1\n\
                   request,1,2,,30,,,,palms\n\
                   confirm,,,1,,,,,pay_2\n\
                   purchase,1,,,,,10,evt_1,pay_1\n";
        let engine = process_events(Cursor::new(csv)).unwrap();

        // Replay is a no-op; the confirm was rejected for insufficient balance.
        assert_eq!(engine.ledger().balance(AccountId(1)).unwrap(), 10);
        let reading = engine.reading(ReadingId(1)).unwrap();
        assert_eq!(reading.state(), reading_ledger_rs::ReadingState::Requested);
    }

    #[test]
    fn write_accounts_to_csv() {
        let csv = "type,account,reader,reading,minutes,rate,amount,key,detail\n\
                   purchase,1,,,,,100,evt_1,pay_1\n";
        let engine = process_events(Cursor::new(csv)).unwrap();

        let mut output = Vec::new();
        write_accounts(&engine, &mut output).unwrap();

        let output_str = String::from_utf8(output).unwrap();
        assert!(output_str.contains("account,balance,rate_per_minute,entries,deactivated"));
        assert!(output_str.contains("1,100,"));
    }
}
