use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Asc,
    Desc,
}

impl Default for Direction {
    fn default() -> Self {
        Direction::Asc
    }
}

/// На что смотрит одна фаза сортировки.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "key", content = "name")]
pub enum SortKeyRef {
    Field(String),
    Score,
    DocId,
    ContextFeature(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortSpec {
    #[serde(flatten)]
    pub key: SortKeyRef,
    #[serde(default)]
    pub direction: Direction,
}

/// Уже упорядоченное представление значения ячейки.
/// Числа (включая score, docid, bool) кодируются в монотонный u64,
/// так что сравнение всегда обычное `<`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellVal {
    Num(u64),
    Str(String),
}

/// Ячейка фазовой сортировки. Отсутствующее значение (и NaN) — всегда в хвосте,
/// направление зашито в ячейку, чтобы кортеж сравнивался лексикографически.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortCell {
    pub desc: bool,
    pub val: Option<CellVal>,
}

impl Ord for SortCell {
    fn cmp(&self, other: &Self) -> Ordering {
        match (&self.val, &other.val) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(a), Some(b)) => {
                let ord = a.cmp(b);
                if self.desc {
                    ord.reverse()
                } else {
                    ord
                }
            }
        }
    }
}

impl PartialOrd for SortCell {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Кортеж фаз; меньший — лучший.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SortKey(pub Vec<SortCell>);

/// Монотонная битовая кодировка f64 (total order по IEEE-754).
pub fn f64_order_bits(v: f64) -> u64 {
    let b = v.to_bits();
    if b >> 63 == 1 {
        !b
    } else {
        b | (1 << 63)
    }
}

pub fn i64_order_bits(v: i64) -> u64 {
    (v as u64) ^ (1 << 63)
}

impl SortCell {
    pub fn missing(desc: bool) -> Self {
        SortCell { desc, val: None }
    }

    /// NaN не сравнивается — уходит в missing, то есть в хвост при любом направлении.
    pub fn from_f64(desc: bool, v: f64) -> Self {
        if v.is_nan() {
            SortCell::missing(desc)
        } else {
            SortCell {
                desc,
                val: Some(CellVal::Num(f64_order_bits(v))),
            }
        }
    }

    pub fn from_i64(desc: bool, v: i64) -> Self {
        SortCell {
            desc,
            val: Some(CellVal::Num(i64_order_bits(v))),
        }
    }

    pub fn from_u64(desc: bool, v: u64) -> Self {
        SortCell {
            desc,
            val: Some(CellVal::Num(v)),
        }
    }

    pub fn from_str(desc: bool, v: &str) -> Self {
        SortCell {
            desc,
            val: Some(CellVal::Str(v.to_string())),
        }
    }
}
