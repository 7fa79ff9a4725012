use crate::value::PropertyValue;

#[derive(Debug, Clone, PartialEq)]
pub struct Property {
    pub name: String,
    pub value: PropertyValue,
}

/// One row returned by a query, properties kept in source order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    properties: Vec<Property>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.push(name, value);
        self
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<PropertyValue>) {
        self.properties.push(Property {
            name: name.into(),
            value: value.into(),
        });
    }

    pub fn properties(&self) -> &[Property] {
        &self.properties
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&PropertyValue> {
        self.properties
            .iter()
            .rev()
            .find(|p| p.name == name)
            .map(|p| &p.value)
    }
}

impl FromIterator<(String, PropertyValue)> for Record {
    fn from_iter<I: IntoIterator<Item = (String, PropertyValue)>>(iter: I) -> Self {
        Self {
            properties: iter
                .into_iter()
                .map(|(name, value)| Property { name, value })
                .collect(),
        }
    }
}

impl IntoIterator for Record {
    type Item = Property;
    type IntoIter = std::vec::IntoIter<Property>;

    fn into_iter(self) -> Self::IntoIter {
        self.properties.into_iter()
    }
}
