//! Tandem Scene - text scene/resource files
//!
//! A format-preserving parser for bracketed `.tscn` / `.tres` text and a
//! structural diff engine over the resulting node trees.

pub mod diff;
pub mod error;
pub mod parser;
pub mod tree;
pub mod variant;

pub use diff::{
    deep_equal, deep_equal_in, diff_files, diff_properties, diff_scene, diff_text, ChangeType,
    DiffFileKind, FileDiff, LineTag, NodeDiff, PropertyChangeType, PropertyDiff, ResourceTable,
    TextHunk, TextLine,
};
pub use error::{SceneError, SceneResult};
pub use parser::{Property, SceneDocument, Section};
pub use tree::{is_synthetic_path, Connection, ExtResource, SceneKind, SceneNode, SceneTree, SubResource};
pub use variant::{parse_variant, Variant};

/// Parse scene or resource text into a node tree
pub fn parse(text: &str) -> SceneResult<SceneTree> {
    SceneTree::parse(text)
}

/// Render a tree back to text; unedited sections come back verbatim
pub fn serialize(tree: &SceneTree) -> String {
    tree.serialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn value_text() -> impl Strategy<Value = String> {
        let leaf = prop_oneof![
            any::<i32>().prop_map(|n| n.to_string()),
            (-1000i32..1000, 0u8..100).prop_map(|(i, f)| format!("{}.{}", i, f)),
            "[a-z ]{0,12}".prop_map(|s| format!("\"{}\"", s)),
            Just("true".to_string()),
            Just("null".to_string()),
            "[a-z0-9_]{1,8}".prop_map(|s| format!("ExtResource(\"{}\")", s)),
        ];
        leaf.prop_recursive(3, 16, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(|v| format!("[{}]", v.join(", "))),
                prop::collection::vec(inner.clone(), 0..4)
                    .prop_map(|v| format!("Vector3({})", v.join(","))),
                prop::collection::vec(("[a-z]{1,5}", inner), 0..3).prop_map(|entries| {
                    let body: Vec<String> = entries
                        .into_iter()
                        .map(|(k, v)| format!("\"{}\": {}", k, v))
                        .collect();
                    format!("{{\n{}\n}}", body.join(",\n"))
                }),
            ]
        })
    }

    fn scene_text() -> impl Strategy<Value = String> {
        let node = (
            "[A-Z][a-z]{0,6}",
            prop::collection::vec(("[a-z_]{1,10}", " {0,2}", value_text()), 0..4),
            prop::bool::ANY,
        );
        prop::collection::vec(node, 0..5).prop_map(|nodes| {
            let mut out = String::from("[gd_scene load_steps=1 format=3]\n\n[node name=\"Root\" type=\"Node\"]\n");
            for (i, (name, props, comment)) in nodes.into_iter().enumerate() {
                out.push('\n');
                if comment {
                    out.push_str("; note\n");
                }
                out.push_str(&format!("[node name=\"{}{}\" type=\"Node\" parent=\".\"]\n", name, i));
                for (key, pad, value) in props {
                    out.push_str(&format!("{}{}={}{}\n", key, pad, pad, value));
                }
            }
            out
        })
    }

    proptest! {
        #[test]
        fn prop_round_trip_is_identity(text in scene_text()) {
            let tree = parse(&text).unwrap();
            prop_assert_eq!(serialize(&tree), text);
        }

        #[test]
        fn prop_diff_with_self_is_empty(text in scene_text()) {
            let tree = parse(&text).unwrap();
            prop_assert!(diff_scene(&tree, &tree).is_empty());
        }
    }

    #[test]
    fn test_untouched_sections_survive_edit() {
        let text = "[gd_scene format=3]\n\n[node name=\"Root\" type=\"Node\"]\nodd   =   [1,2]\n\n[node name=\"A\" type=\"Node\" parent=\".\"]\nx = 1\n";
        let mut tree = parse(text).unwrap();
        tree.set_property("A", "x", Variant::Int(2)).unwrap();
        assert_eq!(
            serialize(&tree),
            "[gd_scene format=3]\n\n[node name=\"Root\" type=\"Node\"]\nodd   =   [1,2]\n\n[node name=\"A\" type=\"Node\" parent=\".\"]\nx = 2\n"
        );
    }
}
