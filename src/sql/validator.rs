//! Read-only, schema-bounded admission check for model-generated SQL.
//!
//! Every decision is made on the `sqlparser` AST. Text is only tokenized (to
//! count statements, with strings and comments understood) and never
//! substring-matched, so comments, literals and keyword casing cannot smuggle
//! an operation past the checks.

use crate::db::schema::SchemaSnapshot;
use serde::Serialize;
use sqlparser::ast::{
    visit_expressions, visit_statements, BinaryOperator, Expr, FunctionArg, FunctionArgExpr,
    FunctionArguments, Ident, ObjectName, OneOrManyWithParens, Query, SelectItem, SetExpr,
    Statement, TableAlias, TableFactor, TableWithJoins, Value, Visit, Visitor,
};
use sqlparser::dialect::DuckDbDialect;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::{Token, Tokenizer};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::ops::ControlFlow;
use tracing::{debug, warn};

/// Functions that write state or reach outside the introspected tables.
const DENIED_FUNCTIONS: &[&str] = &[
    "nextval",
    "setval",
    "currval",
    "read_csv",
    "read_csv_auto",
    "read_parquet",
    "parquet_scan",
    "read_json",
    "read_json_auto",
    "read_ndjson",
    "read_text",
    "read_blob",
    "glob",
    "getenv",
    "current_setting",
    "set_config",
    "query",
    "query_table",
    "pg_sleep",
    "sleep",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    MultiStatementRejected,
    NonReadOperation,
    UnknownSchemaReference,
    UnboundedResultSet,
    UnparseableQuery,
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReasonCode::MultiStatementRejected => "multiple statements",
            ReasonCode::NonReadOperation => "non-read operation",
            ReasonCode::UnknownSchemaReference => "unknown schema reference",
            ReasonCode::UnboundedResultSet => "unbounded result set",
            ReasonCode::UnparseableQuery => "unparseable query",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub reason: ReasonCode,
    pub detail: String,
}

impl Rejection {
    fn new(reason: ReasonCode, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.reason, self.detail)
    }
}

/// A statement that passed validation, rendered from its parsed form.
///
/// Only the validator can build one, which is what keeps rejected SQL away
/// from the executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedQuery {
    sql: String,
    row_limit: u64,
}

impl NormalizedQuery {
    pub(crate) fn new(sql: &str, row_limit: u64) -> Self {
        Self {
            sql: sql.to_string(),
            row_limit,
        }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Most rows the statement may legitimately return
    pub fn row_limit(&self) -> u64 {
        self.row_limit
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationVerdict {
    Accepted(NormalizedQuery),
    Rejected(Rejection),
}

pub struct SafetyValidator {
    row_limit: u64,
}

impl SafetyValidator {
    pub fn new(row_limit: u64) -> Self {
        Self {
            row_limit: row_limit.max(1),
        }
    }

    pub fn validate(&self, candidate: &str, schema: &SchemaSnapshot) -> ValidationVerdict {
        match self.check(candidate, schema) {
            Ok(query) => {
                debug!("Accepted SQL: {}", query.sql());
                ValidationVerdict::Accepted(query)
            }
            Err(rejection) => {
                warn!("Rejected SQL ({}): {}", rejection, candidate);
                ValidationVerdict::Rejected(rejection)
            }
        }
    }

    fn check(&self, candidate: &str, schema: &SchemaSnapshot) -> Result<NormalizedQuery, Rejection> {
        let dialect = DuckDbDialect {};

        let count = count_statements(&dialect, candidate)?;
        if count > 1 {
            return Err(Rejection::new(
                ReasonCode::MultiStatementRejected,
                format!("found {} statements, only one is allowed", count),
            ));
        }

        let mut statements = Parser::parse_sql(&dialect, candidate)
            .map_err(|e| Rejection::new(ReasonCode::UnparseableQuery, e.to_string()))?;
        if statements.len() > 1 {
            return Err(Rejection::new(
                ReasonCode::MultiStatementRejected,
                format!("found {} statements, only one is allowed", statements.len()),
            ));
        }
        let Some(mut statement) = statements.pop() else {
            return Err(Rejection::new(
                ReasonCode::UnparseableQuery,
                "no statement found",
            ));
        };

        check_read_only(&statement)?;
        check_schema_references(&statement, schema)?;
        let row_limit = self.enforce_row_limit(&mut statement)?;

        Ok(NormalizedQuery::new(&statement.to_string(), row_limit))
    }

    /// Runs last, so a limit can never make an otherwise rejected statement
    /// acceptable.
    fn enforce_row_limit(&self, statement: &mut Statement) -> Result<u64, Rejection> {
        let Statement::Query(query) = statement else {
            // SHOW / DESCRIBE / EXPLAIN output is catalog-sized
            return Ok(self.row_limit);
        };

        if let Some(fetch) = &query.fetch {
            let quantity = fetch.quantity.as_ref().and_then(literal_count);
            return match quantity {
                Some(n) if n <= self.row_limit && !fetch.percent => Ok(n),
                _ => Err(Rejection::new(
                    ReasonCode::UnboundedResultSet,
                    format!("FETCH clause must be a literal of at most {} rows", self.row_limit),
                )),
            };
        }

        match query.limit.as_ref().map(literal_count) {
            None => {
                query.limit = Some(number(self.row_limit));
                Ok(self.row_limit)
            }
            Some(Some(n)) if n <= self.row_limit => Ok(n),
            Some(Some(_)) => {
                query.limit = Some(number(self.row_limit));
                Ok(self.row_limit)
            }
            Some(None) => Err(Rejection::new(
                ReasonCode::UnboundedResultSet,
                "LIMIT must be a numeric literal",
            )),
        }
    }
}

fn number(n: u64) -> Expr {
    Expr::Value(Value::Number(n.to_string(), false))
}

fn literal_count(expr: &Expr) -> Option<u64> {
    match expr {
        Expr::Value(Value::Number(n, _)) => n.parse().ok(),
        Expr::Nested(inner) => literal_count(inner),
        _ => None,
    }
}

/// Counts non-empty statements between `;` separators at token level.
fn count_statements(dialect: &DuckDbDialect, sql: &str) -> Result<usize, Rejection> {
    let tokens = Tokenizer::new(dialect, sql)
        .tokenize()
        .map_err(|e| Rejection::new(ReasonCode::UnparseableQuery, e.to_string()))?;

    let mut count = 0;
    let mut pending = false;
    for token in tokens {
        match token {
            Token::SemiColon => {
                if pending {
                    count += 1;
                }
                pending = false;
            }
            Token::Whitespace(_) | Token::EOF => {}
            _ => pending = true,
        }
    }
    if pending {
        count += 1;
    }

    Ok(count)
}

fn non_read(detail: impl Into<String>) -> Rejection {
    Rejection::new(ReasonCode::NonReadOperation, detail)
}

fn statement_kind(statement: &Statement) -> String {
    statement
        .to_string()
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_uppercase()
}

/// SHOW forms only read the catalog; which ones stay inside the snapshot is
/// decided with the schema references.
fn is_allowed_statement(statement: &Statement) -> bool {
    match statement {
        Statement::Query(_) | Statement::ExplainTable { .. } => true,
        Statement::Explain { statement, .. } => matches!(**statement, Statement::Query(_)),
        other => statement_kind(other) == "SHOW",
    }
}

fn check_read_only(statement: &Statement) -> Result<(), Rejection> {
    // The visitor sees the root as well as every nested statement: EXPLAIN
    // targets and data-modifying bodies inside CTEs or set operations.
    let nested = visit_statements(statement, |stmt| {
        if is_allowed_statement(stmt) {
            ControlFlow::Continue(())
        } else {
            ControlFlow::Break(non_read(format!(
                "{} statements are not allowed",
                statement_kind(stmt)
            )))
        }
    });
    if let ControlFlow::Break(rejection) = nested {
        return Err(rejection);
    }

    let mut queries = QueryScan::default();
    let _ = statement.visit(&mut queries);
    if let Some(detail) = queries.write_clause {
        return Err(non_read(detail));
    }

    let functions = visit_expressions(statement, |expr| {
        if let Expr::Function(function) = expr {
            let name = last_part(&function.name);
            if DENIED_FUNCTIONS.contains(&name.as_str()) {
                return ControlFlow::Break(non_read(format!("function {} is not allowed", name)));
            }
        }
        ControlFlow::Continue(())
    });
    if let ControlFlow::Break(rejection) = functions {
        return Err(rejection);
    }

    Ok(())
}

fn last_part(name: &ObjectName) -> String {
    name.0
        .last()
        .map(|ident| ident.value.to_lowercase())
        .unwrap_or_default()
}

fn cte_names(query: &Query) -> Vec<String> {
    query
        .with
        .iter()
        .flat_map(|with| &with.cte_tables)
        .map(|cte| cte.alias.name.value.to_lowercase())
        .collect()
}

/// Calls `f` on every table factor in the FROM clauses of one query level.
/// Nested queries are reached by the visitors on their own.
fn for_each_table_factor(body: &SetExpr, f: &mut impl FnMut(&TableFactor)) {
    match body {
        SetExpr::Select(select) => {
            for from in &select.from {
                for_each_joined_factor(from, f);
            }
        }
        SetExpr::SetOperation { left, right, .. } => {
            for_each_table_factor(left, f);
            for_each_table_factor(right, f);
        }
        _ => {}
    }
}

fn for_each_joined_factor(from: &TableWithJoins, f: &mut impl FnMut(&TableFactor)) {
    let factors = std::iter::once(&from.relation).chain(from.joins.iter().map(|j| &j.relation));
    for factor in factors {
        if let TableFactor::NestedJoin {
            table_with_joins, ..
        } = factor
        {
            for_each_joined_factor(table_with_joins, f);
        }
        f(factor);
    }
}

/// Statement-wide facts: names a statement defines for itself, write
/// clauses, and FROM items that are not plain tables.
#[derive(Default)]
struct QueryScan {
    ctes: HashSet<String>,
    column_aliases: HashSet<String>,
    foreign_sources: Vec<String>,
    write_clause: Option<String>,
}

impl QueryScan {
    fn record_alias_columns(&mut self, alias: &TableAlias) {
        for column in &alias.columns {
            self.column_aliases.insert(column.value.to_lowercase());
        }
    }

    fn scan_selects(&mut self, body: &SetExpr) {
        match body {
            SetExpr::Select(select) => {
                if select.into.is_some() {
                    self.write_clause
                        .get_or_insert_with(|| "SELECT ... INTO creates a table".to_string());
                }
                for item in &select.projection {
                    if let SelectItem::ExprWithAlias { alias, .. } = item {
                        self.column_aliases.insert(alias.value.to_lowercase());
                    }
                }
            }
            SetExpr::SetOperation { left, right, .. } => {
                self.scan_selects(left);
                self.scan_selects(right);
            }
            _ => {}
        }
    }

    fn scan_table_factor(&mut self, factor: &TableFactor) {
        match factor {
            TableFactor::Table { alias, args, .. } => {
                if args.is_some() {
                    self.foreign_sources.push(factor.to_string());
                }
                if let Some(alias) = alias {
                    self.record_alias_columns(alias);
                }
            }
            TableFactor::Derived { alias, .. } => {
                if let Some(alias) = alias {
                    self.record_alias_columns(alias);
                }
            }
            TableFactor::NestedJoin { .. } => {}
            other => self.foreign_sources.push(other.to_string()),
        }
    }
}

impl Visitor for QueryScan {
    type Break = ();

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                self.ctes.insert(cte.alias.name.value.to_lowercase());
                self.record_alias_columns(&cte.alias);
            }
        }
        if !query.locks.is_empty() {
            self.write_clause
                .get_or_insert_with(|| "row locking clauses are not allowed".to_string());
        }
        self.scan_selects(&query.body);
        for_each_table_factor(&query.body, &mut |factor| self.scan_table_factor(factor));
        ControlFlow::Continue(())
    }
}

fn unknown(detail: impl Into<String>) -> Rejection {
    Rejection::new(ReasonCode::UnknownSchemaReference, detail)
}

/// Resolves every relation against the CTEs visible where it appears, then
/// the snapshot.
///
/// A CTE name is visible in the query that defines it and in everything
/// nested below that query. Inside a non-recursive WITH, a CTE body only sees
/// the CTEs declared before it.
struct RelationCheck<'a> {
    schema: &'a SchemaSnapshot,
    scopes: Vec<Vec<String>>,
}

impl<'a> RelationCheck<'a> {
    fn new(schema: &'a SchemaSnapshot) -> Self {
        Self {
            schema,
            scopes: Vec::new(),
        }
    }

    fn check(&self, name: &ObjectName) -> Result<(), Rejection> {
        let parts: Vec<String> = name.0.iter().map(|i| i.value.to_lowercase()).collect();
        let table = parts.last().cloned().unwrap_or_default();

        if parts.len() > 1 {
            let qualifier = &parts[parts.len() - 2];
            if qualifier != &self.schema.schema_name {
                return Err(unknown(format!(
                    "{} is outside the {} schema",
                    name, self.schema.schema_name
                )));
            }
            if parts.len() > 2 {
                return Err(unknown(format!("{} names another catalog", name)));
            }
        } else if self.scopes.iter().any(|scope| scope.contains(&table)) {
            return Ok(());
        }

        if self.schema.has_table(&table) {
            Ok(())
        } else {
            Err(unknown(format!("table {} does not exist", name)))
        }
    }
}

impl Visitor for RelationCheck<'_> {
    type Break = Rejection;

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        let names = cte_names(query);

        if let Some(with) = &query.with {
            for (i, cte) in with.cte_tables.iter().enumerate() {
                let visible = if with.recursive {
                    names.clone()
                } else {
                    names[..i].to_vec()
                };
                let mut body = RelationCheck {
                    schema: self.schema,
                    scopes: self.scopes.clone(),
                };
                body.scopes.push(visible);
                cte.query.visit(&mut body)?;
            }
        }

        // CTE bodies get visited again below under the full scope, which can
        // only accept what the narrower pass above already accepted
        self.scopes.push(names);
        ControlFlow::Continue(())
    }

    fn post_visit_query(&mut self, _query: &Query) -> ControlFlow<Self::Break> {
        self.scopes.pop();
        ControlFlow::Continue(())
    }

    fn pre_visit_relation(&mut self, relation: &ObjectName) -> ControlFlow<Self::Break> {
        match self.check(relation) {
            Ok(()) => ControlFlow::Continue(()),
            Err(rejection) => ControlFlow::Break(rejection),
        }
    }
}

/// What a qualifier such as `c` in `c.name` stands for inside one query
enum Binding {
    Table(String),
    /// Subqueries, CTE references and other sources without a snapshot table
    Opaque,
}

/// Checks column references, resolving qualifiers through the FROM bindings
/// of the enclosing queries, innermost first.
///
/// Unqualified names stay statement-wide: a name any table, alias or CTE in
/// the statement provides is accepted.
struct ColumnCheck<'a> {
    schema: &'a SchemaSnapshot,
    scan: &'a QueryScan,
    cte_scopes: Vec<Vec<String>>,
    bindings: Vec<HashMap<String, Binding>>,
    /// Lambda parameters of the expressions being visited
    locals: Vec<String>,
}

impl<'a> ColumnCheck<'a> {
    fn new(schema: &'a SchemaSnapshot, scan: &'a QueryScan) -> Self {
        Self {
            schema,
            scan,
            cte_scopes: Vec::new(),
            bindings: Vec::new(),
            locals: Vec::new(),
        }
    }

    fn cte_in_scope(&self, name: &ObjectName) -> bool {
        let [ident] = name.0.as_slice() else {
            return false;
        };
        let name = ident.value.to_lowercase();
        self.cte_scopes.iter().any(|scope| scope.contains(&name))
    }

    fn bind(&self, query: &Query) -> HashMap<String, Binding> {
        let mut bound = HashMap::new();
        for_each_table_factor(&query.body, &mut |factor| match factor {
            TableFactor::Table { name, alias, .. } => {
                let binding = if self.cte_in_scope(name) {
                    Binding::Opaque
                } else {
                    Binding::Table(last_part(name))
                };
                let key = match alias {
                    Some(alias) => alias.name.value.to_lowercase(),
                    None => last_part(name),
                };
                bound.insert(key, binding);
            }
            TableFactor::Derived {
                alias: Some(alias), ..
            }
            | TableFactor::NestedJoin {
                alias: Some(alias), ..
            } => {
                bound.insert(alias.name.value.to_lowercase(), Binding::Opaque);
            }
            _ => {}
        });
        bound
    }

    fn resolve(&self, qualifier: &str) -> Option<&Binding> {
        self.bindings
            .iter()
            .rev()
            .find_map(|scope| scope.get(qualifier))
    }

    fn known_column(&self, column: &str) -> bool {
        self.schema.has_column(column)
            || self.scan.column_aliases.contains(column)
            || self.scan.ctes.contains(column)
            || self.locals.iter().any(|local| local == column)
    }

    fn check_expr(&self, expr: &Expr) -> Result<(), Rejection> {
        match expr {
            Expr::Identifier(ident) => {
                if self.known_column(&ident.value.to_lowercase()) {
                    Ok(())
                } else {
                    Err(unknown(format!("column {} does not exist", ident)))
                }
            }
            Expr::CompoundIdentifier(idents) => self.check_qualified(idents),
            _ => Ok(()),
        }
    }

    fn check_qualified(&self, idents: &[Ident]) -> Result<(), Rejection> {
        let parts: Vec<String> = idents.iter().map(|i| i.value.to_lowercase()).collect();
        let display = parts.join(".");
        let (column, qualifier) = match parts.as_slice() {
            [.., qualifier, column] => (column.as_str(), qualifier.as_str()),
            _ => return Ok(()),
        };

        if parts.len() > 3 {
            return Err(unknown(format!("{} is not a column reference", display)));
        }
        if parts.len() == 3 && parts[0] != self.schema.schema_name {
            return Err(unknown(format!(
                "{} is outside the {} schema",
                display, self.schema.schema_name
            )));
        }

        let table = match self.resolve(qualifier) {
            Some(Binding::Table(table)) => self.schema.table(table),
            Some(Binding::Opaque) => {
                return if self.known_column(column) {
                    Ok(())
                } else {
                    Err(unknown(format!("column {} does not exist", display)))
                };
            }
            None => self.schema.table(qualifier),
        };

        match table {
            Some(table) if table.has_column(column) => Ok(()),
            Some(table) => Err(unknown(format!(
                "column {} does not exist in table {}",
                column, table.name
            ))),
            None => Err(unknown(format!("{} does not refer to a known table", display))),
        }
    }
}

impl Visitor for ColumnCheck<'_> {
    type Break = Rejection;

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        self.cte_scopes.push(cte_names(query));
        let bound = self.bind(query);
        self.bindings.push(bound);
        ControlFlow::Continue(())
    }

    fn post_visit_query(&mut self, _query: &Query) -> ControlFlow<Self::Break> {
        self.bindings.pop();
        self.cte_scopes.pop();
        ControlFlow::Continue(())
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<Self::Break> {
        self.locals.extend(lambda_params(expr));
        match self.check_expr(expr) {
            Ok(()) => ControlFlow::Continue(()),
            Err(rejection) => ControlFlow::Break(rejection),
        }
    }

    fn post_visit_expr(&mut self, expr: &Expr) -> ControlFlow<Self::Break> {
        let bound = lambda_params(expr).len();
        self.locals.truncate(self.locals.len().saturating_sub(bound));
        ControlFlow::Continue(())
    }
}

/// Parameters an expression binds for its own subexpressions
fn lambda_params(expr: &Expr) -> Vec<String> {
    match expr {
        Expr::Lambda(lambda) => match &lambda.params {
            OneOrManyWithParens::One(ident) => vec![ident.value.to_lowercase()],
            OneOrManyWithParens::Many(idents) => {
                idents.iter().map(|i| i.value.to_lowercase()).collect()
            }
        },
        // DuckDB writes `list_transform(l, x -> x + 1)`, which parses as an
        // arrow operator on the parameter
        Expr::Function(function) => match &function.args {
            FunctionArguments::List(list) => list
                .args
                .iter()
                .filter_map(|arg| match arg {
                    FunctionArg::Unnamed(FunctionArgExpr::Expr(expr)) => arrow_param(expr),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

fn arrow_param(expr: &Expr) -> Option<String> {
    match expr {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::Arrow,
            ..
        } => match left.as_ref() {
            Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
            _ => None,
        },
        Expr::BinaryOp { left, .. } => arrow_param(left),
        _ => None,
    }
}

/// DuckDB lists the `main` schema when SHOW TABLES names none
const DEFAULT_SHOW_SCHEMA: &str = "main";

fn check_show(statement: &Statement, schema: &SchemaSnapshot) -> Result<(), Rejection> {
    match statement {
        Statement::ShowTables { db_name, .. } => {
            let listed = db_name
                .as_ref()
                .map(|ident| ident.value.to_lowercase())
                .unwrap_or_else(|| DEFAULT_SHOW_SCHEMA.to_string());
            if listed == schema.schema_name {
                Ok(())
            } else {
                Err(unknown(format!(
                    "SHOW TABLES lists schema {}, only {} is available",
                    listed, schema.schema_name
                )))
            }
        }
        Statement::ShowColumns { table_name, .. } => RelationCheck::new(schema).check(table_name),
        // `SHOW customers` describes a table; anything else it names is not one
        Statement::ShowVariable { variable, .. } => match variable.as_slice() {
            [table] if schema.has_table(&table.value.to_lowercase()) => Ok(()),
            _ => Err(unknown(format!(
                "{} does not read a table in the {} schema",
                statement, schema.schema_name
            ))),
        },
        other => Err(unknown(format!(
            "{} reads outside the {} schema",
            other, schema.schema_name
        ))),
    }
}

fn check_schema_references(statement: &Statement, schema: &SchemaSnapshot) -> Result<(), Rejection> {
    if statement_kind(statement) == "SHOW" {
        return check_show(statement, schema);
    }

    let mut scan = QueryScan::default();
    let _ = statement.visit(&mut scan);

    if let Some(source) = scan.foreign_sources.first() {
        return Err(unknown(format!("{} is not a table in the schema", source)));
    }

    let mut relations = RelationCheck::new(schema);
    if let ControlFlow::Break(rejection) = statement.visit(&mut relations) {
        return Err(rejection);
    }

    if let Statement::ExplainTable { table_name, .. } = statement {
        relations.check(table_name)?;
    }

    let mut columns = ColumnCheck::new(schema, &scan);
    if let ControlFlow::Break(rejection) = statement.visit(&mut columns) {
        return Err(rejection);
    }

    Ok(())
}
