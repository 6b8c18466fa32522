//! 집계 트리 (AggTree)
//!
//! 토폴로지 기술 텍스트를 parent→children 간선으로 파싱하고,
//! 루트의 직계 자식마다 서브트리 전체를 `child(child2+child3(...))`
//! 괄호/플러스 문법의 단일 컴포넌트로 직렬화한 관심 이름을 생성

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::name::Name;

/// 토폴로지 노드: 이름과 선언 순서의 자식 목록
#[derive(Debug, Clone, Default)]
pub struct TopologyNode {
    pub name: String,
    pub children: Vec<String>,
}

/// 토폴로지 파싱 섹션
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    None,
    Nodes,
    Links,
}

/// 집계 트리
#[derive(Debug, Default)]
pub struct AggTree {
    topology: HashMap<String, TopologyNode>,
}

impl AggTree {
    /// 토폴로지 텍스트 파싱
    ///
    /// `[nodes]` 섹션: `name:...` 한 줄에 노드 하나.
    /// `[links]` 섹션: `parent:child [params...]` 한 줄에 간선 하나.
    /// `#` 주석과 빈 줄은 무시
    pub fn parse(text: &str) -> Result<Self> {
        let mut tree = AggTree::default();
        let mut section = Section::None;

        for (idx, raw_line) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw_line.trim();

            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            match line {
                "[nodes]" => {
                    section = Section::Nodes;
                    continue;
                }
                "[links]" => {
                    section = Section::Links;
                    continue;
                }
                _ => {}
            }

            match section {
                Section::None => {
                    return Err(Error::Parse {
                        line: line_no,
                        reason: format!("섹션 밖의 내용: '{line}'"),
                    });
                }
                Section::Nodes => {
                    let name = line.split(':').next().unwrap_or("").trim();
                    if name.is_empty() {
                        return Err(Error::Parse {
                            line: line_no,
                            reason: format!("노드 이름 없음: '{line}'"),
                        });
                    }
                    tree.ensure_node(name);
                }
                Section::Links => {
                    let (parent, rest) = line.split_once(':').ok_or_else(|| Error::Parse {
                        line: line_no,
                        reason: format!("'parent:child' 형식 아님: '{line}'"),
                    })?;
                    let parent = parent.trim();
                    // ':' 뒤 첫 토큰이 자식, 나머지는 링크 파라미터
                    let child = rest.split_whitespace().next().unwrap_or("");
                    if parent.is_empty() || child.is_empty() {
                        return Err(Error::Parse {
                            line: line_no,
                            reason: format!("간선의 노드 이름 없음: '{line}'"),
                        });
                    }

                    tree.ensure_node(parent);
                    tree.ensure_node(child);
                    let node = tree
                        .topology
                        .get_mut(parent)
                        .expect("parent node just inserted");
                    if !node.children.contains(&child.to_string()) {
                        node.children.push(child.to_string());
                    }
                }
            }
        }

        Ok(tree)
    }

    fn ensure_node(&mut self, name: &str) {
        self.topology
            .entry(name.to_string())
            .or_insert_with(|| TopologyNode {
                name: name.to_string(),
                children: Vec::new(),
            });
    }

    /// 노드 수
    pub fn node_count(&self) -> usize {
        self.topology.len()
    }

    /// 루트의 직계 자식 (선언 순서, 미지의 루트는 빈 목록)
    pub fn direct_children(&self, root: &str) -> Vec<String> {
        self.topology
            .get(root)
            .map(|n| n.children.clone())
            .unwrap_or_default()
    }

    /// 루트→리프 경로 전체 열거
    ///
    /// 깊거나 넓은 트리에서 스택 깊이를 제한하기 위해
    /// 함수 재귀 대신 (노드, 자식 인덱스) 프레임 스택으로 순회
    pub fn paths_from(&self, root: &str) -> Vec<Vec<String>> {
        let mut paths = Vec::new();
        let mut frames: Vec<(String, usize)> = vec![(root.to_string(), 0)];
        let mut current: Vec<String> = vec![root.to_string()];

        while let Some((node, idx)) = frames.last().cloned() {
            let children = self
                .topology
                .get(&node)
                .map(|n| n.children.as_slice())
                .unwrap_or(&[]);

            if children.is_empty() {
                paths.push(current.clone());
                frames.pop();
                current.pop();
            } else if idx < children.len() {
                if let Some(frame) = frames.last_mut() {
                    frame.1 += 1;
                }
                let child = children[idx].clone();
                current.push(child.clone());
                frames.push((child, 0));
            } else {
                frames.pop();
                current.pop();
            }
        }

        paths
    }

    /// 루트의 직계 자식마다 관심 이름 하나씩 생성
    ///
    /// 이름 구성: [자식 이름] + (자식에게 후손이 있으면) [서브트리 구조 컴포넌트].
    /// 구조 컴포넌트는 자식의 직계 자식들을 `+`로 잇고 각자의 후손을
    /// 괄호로 감싼 문자열. 자식 순서는 토폴로지 선언 순서를 유지
    pub fn interest_names(&self, root: &str) -> Vec<Name> {
        let paths = self.paths_from(root);
        let mut names = Vec::new();

        for first_level in self.direct_children(root) {
            // 이 직계 자식의 서브트리에 한정한 직계 자식 맵
            let mut children_map: HashMap<String, Vec<String>> = HashMap::new();
            for path in &paths {
                if path.len() > 1 && path[1] == first_level {
                    for i in 1..path.len() - 1 {
                        let entry = children_map.entry(path[i].clone()).or_default();
                        if !entry.contains(&path[i + 1]) {
                            entry.push(path[i + 1].clone());
                        }
                    }
                }
            }

            let mut name = Name::new().append_str(&first_level);

            if let Some(children) = children_map.get(&first_level) {
                if !children.is_empty() {
                    let structure = children
                        .iter()
                        .map(|c| render_subtree(c, &children_map))
                        .collect::<Vec<_>>()
                        .join("+");
                    name = name.append_str(structure);
                }
            }

            names.push(name);
        }

        names
    }
}

/// 서브트리를 괄호/플러스 문법 문자열로 직렬화
///
/// 재귀 대신 (노드, 자식 인덱스) 프레임의 명시적 작업 스택 사용.
/// 후손이 없는 노드는 이름만, 있으면 `name(child1+child2)` 형태
fn render_subtree(node: &str, children_map: &HashMap<String, Vec<String>>) -> String {
    struct Frame<'a> {
        kids: &'a [String],
        idx: usize,
    }

    fn kids_of<'a>(map: &'a HashMap<String, Vec<String>>, name: &str) -> &'a [String] {
        map.get(name).map(|v| v.as_slice()).unwrap_or(&[])
    }

    let mut out = String::from(node);
    let root_kids = kids_of(children_map, node);
    if root_kids.is_empty() {
        return out;
    }
    out.push('(');

    let mut stack = vec![Frame {
        kids: root_kids,
        idx: 0,
    }];

    loop {
        let next_child: Option<&String> = match stack.last_mut() {
            None => break,
            Some(top) if top.idx < top.kids.len() => {
                if top.idx > 0 {
                    out.push('+');
                }
                let kids = top.kids;
                let idx = top.idx;
                top.idx += 1;
                Some(&kids[idx])
            }
            Some(_) => None,
        };

        match next_child {
            Some(child) => {
                out.push_str(child);
                let kids = kids_of(children_map, child);
                if !kids.is_empty() {
                    out.push('(');
                    stack.push(Frame { kids, idx: 0 });
                }
            }
            None => {
                out.push(')');
                stack.pop();
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOPOLOGY: &str = "\
# 테스트 토폴로지
[nodes]
con0:_
agg1:_
agg2:_
pro1:_
pro2:_

[links]
con0:agg1 bw=10 delay=5ms
con0:agg2 bw=10 delay=5ms
agg1:pro1 bw=10 delay=5ms
agg1:pro2 bw=10 delay=5ms
";

    #[test]
    fn test_parse_and_children() {
        let tree = AggTree::parse(TOPOLOGY).unwrap();
        assert_eq!(tree.direct_children("con0"), vec!["agg1", "agg2"]);
        assert_eq!(tree.direct_children("agg1"), vec!["pro1", "pro2"]);
        assert!(tree.direct_children("unknown").is_empty());
    }

    #[test]
    fn test_parse_error_outside_section() {
        let err = AggTree::parse("con0:agg1\n").unwrap_err();
        assert!(matches!(err, Error::Parse { line: 1, .. }));
    }

    #[test]
    fn test_parse_error_malformed_link() {
        let err = AggTree::parse("[links]\nnot-a-link\n").unwrap_err();
        assert!(matches!(err, Error::Parse { line: 2, .. }));
    }

    #[test]
    fn test_paths() {
        let tree = AggTree::parse(TOPOLOGY).unwrap();
        let paths = tree.paths_from("con0");
        assert_eq!(
            paths,
            vec![
                vec!["con0".to_string(), "agg1".into(), "pro1".into()],
                vec!["con0".to_string(), "agg1".into(), "pro2".into()],
                vec!["con0".to_string(), "agg2".into()],
            ]
        );
    }

    #[test]
    fn test_interest_names() {
        let tree = AggTree::parse(TOPOLOGY).unwrap();
        let names = tree.interest_names("con0");

        assert_eq!(names.len(), 2);
        assert_eq!(names[0].to_uri(), "/agg1/pro1+pro2");
        // 후손 없는 직계 자식은 괄호 없이 이름만
        assert_eq!(names[1].to_uri(), "/agg2");

        // 같은 토폴로지에 대해 결과는 결정적
        assert_eq!(tree.interest_names("con0"), names);
    }

    #[test]
    fn test_interest_names_nested() {
        let topology = "\
[links]
con0:agg1 x
agg1:agg2 x
agg1:agg3 x
agg2:pro1 x
agg2:pro2 x
";
        let tree = AggTree::parse(topology).unwrap();
        let names = tree.interest_names("con0");
        assert_eq!(names.len(), 1);
        assert_eq!(names[0].to_uri(), "/agg1/agg2(pro1+pro2)+agg3");
    }

    #[test]
    fn test_deep_chain_does_not_recurse() {
        // 수천 단계 체인도 명시적 스택으로 처리
        let mut topology = String::from("[links]\n");
        topology.push_str("con0:n0 x\n");
        for i in 0..4000 {
            topology.push_str(&format!("n{}:n{} x\n", i, i + 1));
        }
        let tree = AggTree::parse(&topology).unwrap();
        let names = tree.interest_names("con0");
        assert_eq!(names.len(), 1);
        let uri = names[0].to_uri();
        assert!(uri.starts_with("/n0/n1(n2(n3("));
        assert!(uri.ends_with("))))"));
    }
}
