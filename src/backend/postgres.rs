//! PostgreSQL Backend
//!
//! One physical `PgConnection` per configured backend. Statements without
//! parameters go through the simple-query protocol, so session setup made of
//! several `;`-separated statements works.
//!
//! Parameterized statements are prepared with every parameter type left
//! unspecified, the way a text-protocol client sends them: the server infers
//! each type from context, and every bind value is converted to that type
//! before it is encoded. A value the inferred type cannot hold is an error.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use futures::stream::BoxStream;
use futures::TryStreamExt;
use rust_decimal::Decimal;
use sqlx::encode::IsNull;
use sqlx::postgres::types::Oid;
use sqlx::postgres::{
    PgArgumentBuffer, PgArguments, PgColumn, PgConnectOptions, PgConnection, PgQueryResult, PgRow,
    PgTypeInfo, PgTypeKind, PgValueFormat, PgValueRef,
};
use sqlx::query::Query;
use sqlx::{Column, Connection, Either, Encode, Executor, Postgres, Row as _, Statement, TypeInfo, ValueRef};

use super::{bound_parameters, BackendConnection, Connector, QueryResult, Row, Value};
use crate::config::BackendConfig;
use crate::error::{Error, Result};

type PgStream<'e> = BoxStream<'e, std::result::Result<Either<PgQueryResult, PgRow>, sqlx::Error>>;

const TIMESTAMP_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];
const TIMESTAMPTZ_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%dT%H:%M:%S%.f%#z"];

/// Connector that opens real PostgreSQL connections
#[derive(Debug, Default, Clone, Copy)]
pub struct PgConnector;

#[async_trait::async_trait]
impl Connector for PgConnector {
    async fn connect(&self, index: usize, config: &BackendConfig) -> Result<Box<dyn BackendConnection>> {
        let options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.user)
            .password(&config.password)
            .database(&config.database);

        let target = config.display_target();
        let conn = tokio::time::timeout(config.connect_timeout(), PgConnection::connect_with(&options))
            .await
            .map_err(|_| Error::ConnectionTimeout(target.clone()))?
            .map_err(|e| Error::ConnectionFailed {
                address: target.clone(),
                reason: e.to_string(),
            })?;

        tracing::debug!("Opened connection to backend {} ({})", index, target);
        Ok(Box::new(PgBackend { index, conn }))
    }
}

/// Live connection to one PostgreSQL backend
pub struct PgBackend {
    index: usize,
    conn: PgConnection,
}

impl PgBackend {
    async fn execute_prepared(&mut self, query: &str, params: &[Value]) -> Result<QueryResult> {
        let unspecified = vec![PgTypeInfo::with_oid(Oid(0)); params.len()];
        let statement = (&mut self.conn).prepare_with(query, &unspecified).await?;

        let resolved = match statement.parameters() {
            Some(Either::Left(types)) if types.len() == params.len() => types.to_vec(),
            Some(Either::Left(types)) => {
                return Err(Error::TypeConversion(format!(
                    "statement takes {} parameters, {} given",
                    types.len(),
                    params.len()
                )))
            }
            _ => return Err(Error::TypeConversion("parameter types were not described".into())),
        };

        let mut prepared = statement.query();
        for (value, target) in params.iter().zip(&resolved) {
            prepared = bind_param(prepared, convert(value, target)?);
        }

        collect(prepared.fetch_many(&mut self.conn)).await
    }
}

#[async_trait::async_trait]
impl BackendConnection for PgBackend {
    async fn execute(&mut self, query: &str, parameters: Option<&[Value]>) -> Result<QueryResult> {
        let backend = self.index;
        let result = match bound_parameters(parameters) {
            None => collect((&mut self.conn).fetch_many(query)).await,
            Some(params) => self.execute_prepared(query, params).await,
        };

        result.map_err(|e| Error::QueryExecution {
            backend,
            reason: e.to_string(),
        })
    }
}

async fn collect(mut stream: PgStream<'_>) -> Result<QueryResult> {
    let mut result = QueryResult::default();
    while let Some(item) = stream.try_next().await? {
        match item {
            Either::Left(done) => result.rows_affected += done.rows_affected(),
            Either::Right(row) => result.rows.push(decode_row(&row)?),
        }
    }
    Ok(result)
}

/// Text parameter whose type is left for the server to infer
struct Unspecified(Option<String>);

impl sqlx::Type<Postgres> for Unspecified {
    fn type_info() -> PgTypeInfo {
        PgTypeInfo::with_oid(Oid(0))
    }
}

impl<'q> Encode<'q, Postgres> for Unspecified {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> IsNull {
        match &self.0 {
            Some(text) => <&str as Encode<'q, Postgres>>::encode_by_ref(&text.as_str(), buf),
            None => IsNull::Yes,
        }
    }
}

/// A bind value in the representation of its inferred parameter type
#[derive(Debug, PartialEq)]
enum Param {
    Null,
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    Numeric(Decimal),
    Bytes(Vec<u8>),
    Uuid(uuid::Uuid),
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Json(serde_json::Value),
    Text(String),
}

fn bind_param<'q>(
    query: Query<'q, Postgres, PgArguments>,
    param: Param,
) -> Query<'q, Postgres, PgArguments> {
    match param {
        Param::Null => query.bind(Unspecified(None)),
        Param::Bool(b) => query.bind(b),
        Param::Int2(i) => query.bind(i),
        Param::Int4(i) => query.bind(i),
        Param::Int8(i) => query.bind(i),
        Param::Float4(f) => query.bind(f),
        Param::Float8(f) => query.bind(f),
        Param::Numeric(d) => query.bind(d),
        Param::Bytes(b) => query.bind(b),
        Param::Uuid(u) => query.bind(u),
        Param::Date(d) => query.bind(d),
        Param::Time(t) => query.bind(t),
        Param::Timestamp(t) => query.bind(t),
        Param::TimestampTz(t) => query.bind(t),
        Param::Json(j) => query.bind(sqlx::types::Json(j)),
        Param::Text(s) => query.bind(Unspecified(Some(s))),
    }
}

/// Convert a bind value to the parameter type the server inferred
fn convert(value: &Value, target: &PgTypeInfo) -> Result<Param> {
    if value.is_null() {
        return Ok(Param::Null);
    }

    match target.kind() {
        PgTypeKind::Domain(base) => convert(value, base),
        // enum values travel as their label
        PgTypeKind::Enum(_) => Ok(Param::Text(value.to_string())),
        _ => match (value, target.name()) {
            (Value::Bytes(b), "BYTEA") => Ok(Param::Bytes(b.clone())),
            (Value::Json(j), "JSON" | "JSONB") => Ok(Param::Json(j.clone())),
            (other, type_name) => parse_text(&other.to_string(), type_name),
        },
    }
}

fn invalid(text: &str, type_name: &str, reason: impl fmt::Display) -> Error {
    Error::TypeConversion(format!("cannot convert {:?} to {}: {}", text, type_name, reason))
}

/// Parse the text form of a value as PostgreSQL would for `type_name`
fn parse_text(text: &str, type_name: &str) -> Result<Param> {
    let trimmed = text.trim();
    let param = match type_name {
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" | "UNKNOWN" => Param::Text(text.to_string()),
        "BOOL" => Param::Bool(parse_bool(trimmed).ok_or_else(|| invalid(text, type_name, "not a boolean"))?),
        "INT2" => Param::Int2(trimmed.parse().map_err(|e| invalid(text, type_name, e))?),
        "INT4" => Param::Int4(trimmed.parse().map_err(|e| invalid(text, type_name, e))?),
        "INT8" => Param::Int8(trimmed.parse().map_err(|e| invalid(text, type_name, e))?),
        "FLOAT4" => Param::Float4(trimmed.parse().map_err(|e| invalid(text, type_name, e))?),
        "FLOAT8" => Param::Float8(trimmed.parse().map_err(|e| invalid(text, type_name, e))?),
        "NUMERIC" => Param::Numeric(Decimal::from_str(trimmed).map_err(|e| invalid(text, type_name, e))?),
        "UUID" => Param::Uuid(uuid::Uuid::parse_str(trimmed).map_err(|e| invalid(text, type_name, e))?),
        "BYTEA" => match text.strip_prefix("\\x") {
            Some(digits) => Param::Bytes(hex::decode(digits).map_err(|e| invalid(text, type_name, e))?),
            None => Param::Bytes(text.as_bytes().to_vec()),
        },
        "DATE" => NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
            .ok()
            .or_else(|| parse_timestamp(trimmed).map(|t| t.date()))
            .map(Param::Date)
            .ok_or_else(|| invalid(text, type_name, "not a date"))?,
        "TIME" => NaiveTime::parse_from_str(trimmed, "%H:%M:%S%.f")
            .or_else(|_| NaiveTime::parse_from_str(trimmed, "%H:%M"))
            .map(Param::Time)
            .map_err(|e| invalid(text, type_name, e))?,
        "TIMESTAMP" => parse_timestamp(trimmed)
            .map(Param::Timestamp)
            .ok_or_else(|| invalid(text, type_name, "not a timestamp"))?,
        "TIMESTAMPTZ" => parse_with_offset(trimmed)
            .map(|t| t.with_timezone(&Utc))
            .or_else(|| parse_timestamp(trimmed).map(|t| t.and_utc()))
            .map(Param::TimestampTz)
            .ok_or_else(|| invalid(text, type_name, "not a timestamp"))?,
        "JSON" | "JSONB" => Param::Json(serde_json::from_str(text).map_err(|e| invalid(text, type_name, e))?),
        other => {
            return Err(Error::TypeConversion(format!(
                "parameters of type {} are not supported",
                other
            )))
        }
    };
    Ok(param)
}

fn parse_bool(text: &str) -> Option<bool> {
    match text.to_ascii_lowercase().as_str() {
        "t" | "true" | "y" | "yes" | "on" | "1" => Some(true),
        "f" | "false" | "n" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

fn parse_with_offset(text: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(text)
        .ok()
        .or_else(|| TIMESTAMPTZ_FORMATS.iter().find_map(|f| DateTime::parse_from_str(text, f).ok()))
}

/// Timestamp without time zone; an explicit offset is ignored, as the server does
fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(text, f).ok())
        .or_else(|| parse_with_offset(text).map(|t| t.naive_local()))
        .or_else(|| {
            NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

/// How a result column is decoded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CellKind {
    Bool,
    Int2,
    Int4,
    Int8,
    Float4,
    Float8,
    Numeric,
    Bytes,
    Uuid,
    Date,
    Time,
    Timestamp,
    TimestampTz,
    Json,
    Text,
    Other,
}

impl CellKind {
    fn of(type_name: &str) -> Self {
        match type_name {
            "BOOL" => CellKind::Bool,
            "INT2" => CellKind::Int2,
            "INT4" => CellKind::Int4,
            "INT8" => CellKind::Int8,
            "FLOAT4" => CellKind::Float4,
            "FLOAT8" => CellKind::Float8,
            "NUMERIC" => CellKind::Numeric,
            "BYTEA" => CellKind::Bytes,
            "UUID" => CellKind::Uuid,
            "DATE" => CellKind::Date,
            "TIME" => CellKind::Time,
            "TIMESTAMP" => CellKind::Timestamp,
            "TIMESTAMPTZ" => CellKind::TimestampTz,
            "JSON" | "JSONB" => CellKind::Json,
            "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" | "UNKNOWN" => CellKind::Text,
            _ => CellKind::Other,
        }
    }
}

fn decode_row(row: &PgRow) -> Result<Row> {
    let columns = row
        .columns()
        .iter()
        .map(|column| -> Result<(String, Value)> {
            Ok((column.name().to_string(), decode_cell(row, column)?))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Row { columns })
}

fn decode_cell(row: &PgRow, column: &PgColumn) -> Result<Value> {
    let index = column.ordinal();
    let raw = row.try_get_raw(index)?;
    if raw.is_null() {
        return Ok(Value::Null);
    }

    let type_info = column.type_info();
    let value = match CellKind::of(type_info.name()) {
        CellKind::Bool => Value::Bool(row.try_get(index)?),
        CellKind::Int2 => Value::Int(row.try_get::<i16, _>(index)?.into()),
        CellKind::Int4 => Value::Int(row.try_get::<i32, _>(index)?.into()),
        CellKind::Int8 => Value::Int(row.try_get(index)?),
        CellKind::Float4 => Value::Float(row.try_get::<f32, _>(index)?.into()),
        CellKind::Float8 => Value::Float(row.try_get(index)?),
        CellKind::Numeric => Value::Decimal(row.try_get(index)?),
        CellKind::Bytes => Value::Bytes(row.try_get(index)?),
        CellKind::Uuid => Value::Uuid(row.try_get(index)?),
        CellKind::Date => Value::Date(row.try_get(index)?),
        CellKind::Time => Value::Time(row.try_get(index)?),
        CellKind::Timestamp => Value::Timestamp(row.try_get::<NaiveDateTime, _>(index)?.and_utc()),
        CellKind::TimestampTz => Value::Timestamp(row.try_get(index)?),
        CellKind::Json => Value::Json(row.try_get(index)?),
        CellKind::Text => Value::String(row.try_get(index)?),
        CellKind::Other => render_text(raw, type_info)?,
    };
    Ok(value)
}

/// Text rendering of a column type without a dedicated decoder.
///
/// Only possible when the server sent the cell as text (simple-query
/// results, enum labels); binary cells of other types are an error.
fn render_text(raw: PgValueRef<'_>, type_info: &PgTypeInfo) -> Result<Value> {
    let textual = matches!(raw.format(), PgValueFormat::Text) || matches!(type_info.kind(), PgTypeKind::Enum(_));
    if !textual {
        return Err(Error::TypeConversion(format!(
            "cannot decode a column of type {}, cast it to text",
            type_info.name()
        )));
    }

    raw.as_str()
        .map(|s| Value::String(s.to_string()))
        .map_err(|e| Error::TypeConversion(format!("column of type {}: {}", type_info.name(), e)))
}
