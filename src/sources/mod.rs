//! Data Source Registry
//!
//! Closed set of data sources a query may reference. Each source carries a
//! static descriptor with its table name, attribute columns, the data-type
//! label of every attribute and the column kind used to read stored values.
//!
//! Query text names sources by class name (`RandomData.random_two`); storage
//! uses the table name (`random_data`).

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A data source known to the system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DataSource {
    PersonalInformation,
    RandomData,
    LocationProbe,
    OpenhabSensor,
    Iris,
}

/// Category of user data, shown to users before they consent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserDataType {
    Personal,
    Location,
    Medical,
    SmartHome,
    OnlineActivity,
    Consumer,
}

impl UserDataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Personal => "personal",
            Self::Location => "location",
            Self::Medical => "medical",
            Self::SmartHome => "smart_home",
            Self::OnlineActivity => "online_activity",
            Self::Consumer => "consumer",
        }
    }
}

/// Storage type of an attribute column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Real,
    Integer,
    Text,
    Bool,
}

impl ColumnKind {
    /// SQLite column affinity
    pub fn sql_type(&self) -> &'static str {
        match self {
            Self::Real => "REAL",
            Self::Integer | Self::Bool => "INTEGER",
            Self::Text => "TEXT",
        }
    }

    /// Whether values of this column can be aggregated
    pub fn is_numeric(&self) -> bool {
        !matches!(self, Self::Text)
    }
}

/// One attribute column of a data source
#[derive(Debug, Clone, Copy)]
pub struct Column {
    pub name: &'static str,
    pub kind: ColumnKind,
    pub label: UserDataType,
    /// Part of the primary key besides `(user_id, timestamp)`
    pub key: bool,
}

const fn col(name: &'static str, kind: ColumnKind, label: UserDataType) -> Column {
    Column {
        name,
        kind,
        label,
        key: false,
    }
}

/// Static description of a data source
#[derive(Debug)]
pub struct SourceDescriptor {
    pub source: DataSource,
    pub class_name: &'static str,
    pub table_name: &'static str,
    pub columns: &'static [Column],
}

use ColumnKind::{Bool, Integer, Real, Text};
use UserDataType::{Location, Personal, SmartHome};

static PERSONAL_INFORMATION: SourceDescriptor = SourceDescriptor {
    source: DataSource::PersonalInformation,
    class_name: "PersonalInformation",
    table_name: "personal_information",
    columns: &[
        col("user_name", Text, Personal),
        col("first_name", Text, Personal),
        col("last_name", Text, Personal),
        col("street", Text, Personal),
        col("city", Text, Personal),
        col("zip_code", Text, Personal),
        col("country", Text, Personal),
        col("birthday", Text, Personal),
        col("email", Text, Personal),
        col("gender", Text, Personal),
        col("anon", Bool, Personal),
    ],
};

static RANDOM_DATA: SourceDescriptor = SourceDescriptor {
    source: DataSource::RandomData,
    class_name: "RandomData",
    table_name: "random_data",
    columns: &[
        col("random_one", Real, SmartHome),
        col("random_two", Real, Location),
    ],
};

static LOCATION_PROBE: SourceDescriptor = SourceDescriptor {
    source: DataSource::LocationProbe,
    class_name: "LocationProbe",
    table_name: "location_probe",
    columns: &[
        col("accuracy", Real, Location),
        col("altitude", Integer, Location),
    ],
};

static OPENHAB_SENSOR: SourceDescriptor = SourceDescriptor {
    source: DataSource::OpenhabSensor,
    class_name: "OpenhabSensor",
    table_name: "openhab_sensor",
    columns: &[
        Column {
            name: "sensor_name",
            kind: Text,
            label: SmartHome,
            key: true,
        },
        col("data_type", Text, SmartHome),
        col("value", Text, SmartHome),
    ],
};

static IRIS: SourceDescriptor = SourceDescriptor {
    source: DataSource::Iris,
    class_name: "Iris",
    table_name: "iris",
    columns: &[
        col("sepal_length", Real, SmartHome),
        col("sepal_width", Real, SmartHome),
        col("petal_length", Real, SmartHome),
        col("petal_width", Real, SmartHome),
        col("iris_class", Text, SmartHome),
    ],
};

impl DataSource {
    pub const ALL: [DataSource; 5] = [
        DataSource::PersonalInformation,
        DataSource::RandomData,
        DataSource::LocationProbe,
        DataSource::OpenhabSensor,
        DataSource::Iris,
    ];

    pub fn descriptor(self) -> &'static SourceDescriptor {
        match self {
            Self::PersonalInformation => &PERSONAL_INFORMATION,
            Self::RandomData => &RANDOM_DATA,
            Self::LocationProbe => &LOCATION_PROBE,
            Self::OpenhabSensor => &OPENHAB_SENSOR,
            Self::Iris => &IRIS,
        }
    }

    /// Name used in query text
    pub fn class_name(self) -> &'static str {
        self.descriptor().class_name
    }

    pub fn table_name(self) -> &'static str {
        self.descriptor().table_name
    }

    pub fn from_class_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.class_name() == name)
    }

    pub fn from_table_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.table_name() == name)
    }

    pub fn column(self, attribute: &str) -> Option<&'static Column> {
        self.descriptor().columns.iter().find(|c| c.name == attribute)
    }

    pub fn attributes(self) -> impl Iterator<Item = &'static str> {
        self.descriptor().columns.iter().map(|c| c.name)
    }

    pub fn label(self, attribute: &str) -> Option<UserDataType> {
        self.column(attribute).map(|c| c.label)
    }
}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.class_name())
    }
}

impl SourceDescriptor {
    /// DDL for the raw attribute table of this source
    pub fn create_table_sql(&self) -> String {
        let mut columns = vec![
            "user_id INTEGER NOT NULL".to_string(),
            "timestamp INTEGER NOT NULL".to_string(),
        ];
        let mut key = vec!["user_id", "timestamp"];
        for column in self.columns {
            if column.key {
                columns.push(format!("{} {} NOT NULL", column.name, column.kind.sql_type()));
                key.push(column.name);
            } else {
                columns.push(format!("{} {}", column.name, column.kind.sql_type()));
            }
        }
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({}, PRIMARY KEY ({}))",
            self.table_name,
            columns.join(", "),
            key.join(", ")
        )
    }
}

/// A resolved `(data source, attribute)` pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AttributeId {
    pub source: DataSource,
    pub attribute: String,
}

impl AttributeId {
    pub fn new(source: DataSource, attribute: impl Into<String>) -> Self {
        Self {
            source,
            attribute: attribute.into(),
        }
    }

    pub fn column(&self) -> Option<&'static Column> {
        self.source.column(&self.attribute)
    }

    pub fn is_numeric(&self) -> bool {
        self.column().map(|c| c.kind.is_numeric()).unwrap_or(false)
    }
}

impl fmt::Display for AttributeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.source, self.attribute)
    }
}

/// A raw value read from an attribute table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Number(f64),
    Text(String),
}

impl AttributeValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Text(_) => None,
        }
    }

    /// Compare against a literal taken from query text.
    ///
    /// Numeric when both sides are numbers, lexicographic otherwise
    /// (dates are stored as `YYYY/MM/DD` and compare correctly as text).
    pub fn compare_literal(&self, literal: &str) -> Ordering {
        match (self, literal.parse::<f64>()) {
            (Self::Number(n), Ok(l)) => n.partial_cmp(&l).unwrap_or(Ordering::Equal),
            (Self::Number(n), Err(_)) => format_number(*n).as_str().cmp(literal),
            (Self::Text(s), _) => s.as_str().cmp(literal),
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => f.write_str(&format_number(*n)),
            Self::Text(s) => f.write_str(s),
        }
    }
}

/// Format a number without a trailing `.0` for integral values
pub fn format_number(n: f64) -> String {
    format!("{}", n)
}
