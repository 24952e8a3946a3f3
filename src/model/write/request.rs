// Copyright 2024 TSDB Project Authors. Licensed under Apache-2.0.

//! Write request and some useful tools for it.

use std::collections::HashMap;

use crate::model::write::point::Point;

/// Write request holding points grouped by table.
#[derive(Clone, Debug, Default)]
pub struct Request {
    pub point_groups: HashMap<String, Vec<Point>>,
}

impl Request {
    pub fn add_point(&mut self, point: Point) -> &mut Self {
        let points = self.point_groups.entry(point.table.clone()).or_default();
        points.push(point);

        self
    }

    pub fn add_points(&mut self, points: Vec<Point>) -> &mut Self {
        for point in points {
            self.add_point(point);
        }

        self
    }

    pub fn is_empty(&self) -> bool {
        self.point_groups.is_empty()
    }

    /// Total number of points over all tables.
    pub fn num_points(&self) -> usize {
        self.point_groups.values().map(Vec::len).sum()
    }

    pub fn tables(&self) -> Vec<String> {
        self.point_groups.keys().cloned().collect()
    }
}

pub mod pb_builder {
    use std::collections::{BTreeMap, HashMap};

    use horaedbproto::storage::{
        Field, FieldGroup as FieldGroupPb, Tag as TagPb, WriteSeriesEntry as WriteSeriesEntryPb,
        WriteTableRequest as WriteTableRequestPb,
    };

    use crate::model::{
        value::{TimestampMs, Value},
        write::{point::Point, Request},
    };

    type Fields = BTreeMap<String, Value>;

    /// Used to build the per-table request pbs from a [Request].
    pub struct WriteTableRequestPbsBuilder(pub Request);

    impl WriteTableRequestPbsBuilder {
        pub fn build(self) -> Vec<WriteTableRequestPb> {
            let point_groups = self.0.point_groups;

            let mut table_request_pbs = Vec::with_capacity(point_groups.len());
            for (table, points) in point_groups {
                let table_request_pb = TableRequestPbBuilder::new(table, points).build();
                table_request_pbs.push(table_request_pb);
            }

            table_request_pbs
        }
    }

    struct TableRequestPbBuilder {
        table: String,
        series_entries: Vec<SeriesEntry>,
    }

    impl TableRequestPbBuilder {
        pub fn new(table: String, points: Vec<Point>) -> Self {
            // Partition points by series, points of one series share one
            // entry with per-timestamp field groups.
            let mut series_entries_by_key = HashMap::new();
            for point in points {
                debug_assert_eq!(point.table, table);
                let series_key = point.series_key();
                let series_entry =
                    series_entries_by_key
                        .entry(series_key)
                        .or_insert_with(|| SeriesEntry {
                            tags: point.tags,
                            ts_fields: BTreeMap::new(),
                        });
                series_entry.ts_fields.insert(point.timestamp, point.fields);
            }

            let series_entries = series_entries_by_key.into_values().collect();

            Self {
                table,
                series_entries,
            }
        }

        pub fn build(self) -> WriteTableRequestPb {
            let mut tags_dict = NameDict::new();
            let mut fields_dict = NameDict::new();
            let mut entry_pbs = Vec::with_capacity(self.series_entries.len());
            for entry in self.series_entries {
                entry_pbs.push(Self::build_series_entry(
                    &mut tags_dict,
                    &mut fields_dict,
                    entry,
                ));
            }

            WriteTableRequestPb {
                table: self.table,
                tag_names: tags_dict.convert_ordered(),
                field_names: fields_dict.convert_ordered(),
                entries: entry_pbs,
            }
        }

        fn build_series_entry(
            tags_dict: &mut NameDict,
            fields_dict: &mut NameDict,
            entry: SeriesEntry,
        ) -> WriteSeriesEntryPb {
            let tags = Self::build_tags(tags_dict, entry.tags);
            let field_groups = Self::build_ts_fields(fields_dict, entry.ts_fields);

            WriteSeriesEntryPb { tags, field_groups }
        }

        fn build_tags(tags_dict: &mut NameDict, tags: BTreeMap<String, Value>) -> Vec<TagPb> {
            let mut tag_pbs = Vec::with_capacity(tags.len());
            for (name, val) in tags {
                let tag_pb = TagPb {
                    name_index: tags_dict.insert(name),
                    value: Some(val.into()),
                };
                tag_pbs.push(tag_pb);
            }

            tag_pbs
        }

        fn build_ts_fields(
            fields_dict: &mut NameDict,
            ts_fields: BTreeMap<TimestampMs, Fields>,
        ) -> Vec<FieldGroupPb> {
            let mut field_group_pbs = Vec::with_capacity(ts_fields.len());
            for (ts, fields) in ts_fields {
                let mut field_pbs = Vec::with_capacity(fields.len());
                for (name, val) in fields {
                    field_pbs.push(Field {
                        name_index: fields_dict.insert(name),
                        value: Some(val.into()),
                    });
                }

                field_group_pbs.push(FieldGroupPb {
                    timestamp: ts,
                    fields: field_pbs,
                });
            }

            field_group_pbs
        }
    }

    #[derive(Clone, Default, Debug)]
    struct SeriesEntry {
        tags: BTreeMap<String, Value>,
        ts_fields: BTreeMap<TimestampMs, Fields>,
    }

    /// Interns column names so entries refer to them by index.
    struct NameDict {
        dict: HashMap<String, u32>,
        name_idx: u32,
    }

    impl NameDict {
        fn new() -> Self {
            NameDict {
                dict: HashMap::new(),
                name_idx: 0,
            }
        }

        fn insert(&mut self, name: String) -> u32 {
            *self.dict.entry(name).or_insert_with(|| {
                let old_name_idx = self.name_idx;
                self.name_idx += 1;
                old_name_idx
            })
        }

        fn convert_ordered(self) -> Vec<String> {
            let mut ordered = vec![String::new(); self.dict.len()];
            self.dict
                .into_iter()
                .for_each(|(name, idx)| ordered[idx as usize] = name);
            ordered
        }
    }

}
